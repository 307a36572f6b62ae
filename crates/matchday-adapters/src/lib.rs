//! Source adapter contract + markup adapters for the supported fixture listings.

use matchday_core::{split_teams, DateLabelStyle, RawFixture};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "matchday-adapters";

pub const SKYSPORTS_SOURCE_ID: &str = "skysports";
pub const LIVE_FOOTBALL_ON_TV_SOURCE_ID: &str = "live-football-on-tv";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector {selector:?}: {message}")]
    InvalidSelector { selector: String, message: String },
    #[error("no adapter registered for source {0}")]
    UnknownSource(String),
}

/// Pure extraction: markup in, raw fixtures out. Implementations never fail on
/// malformed fixtures; they drop them and keep going.
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    fn date_label_style(&self) -> DateLabelStyle;

    fn extract<'a>(&'a self, document: &'a Html) -> Box<dyn Iterator<Item = RawFixture> + 'a>;
}

/// Parses `html` and drains the adapter. `Html` is not `Send`, so async callers
/// go through here instead of holding a document across an await.
pub fn extract_page(adapter: &dyn SourceAdapter, html: &str) -> Vec<RawFixture> {
    let document = Html::parse_document(html);
    adapter.extract(&document).collect()
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::InvalidSelector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

/// Text fragments trimmed and joined by single spaces.
fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope.select(selector).next().map(element_text)
}

fn has_class(element: ElementRef<'_>, class: &str) -> bool {
    element.value().classes().any(|c| c == class)
}

/// `Competition, Channel` detail line. Everything after the first comma is the
/// channel.
fn split_detail(detail: &str) -> (String, String) {
    match detail.split_once(',') {
        Some((competition, channel)) => (competition.trim().to_string(), channel.trim().to_string()),
        None => (detail.trim().to_string(), String::new()),
    }
}

/// Selectors for listings where a date heading is followed by a sibling
/// container of fixtures.
#[derive(Debug, Clone, Copy)]
pub struct HeadingGroupedLayout {
    pub heading: &'static str,
    pub container_tag: &'static str,
    pub container_class: &'static str,
    pub fixture: &'static str,
    pub row: &'static str,
    pub cell: &'static str,
    pub detail: &'static str,
}

pub const SKYSPORTS_LAYOUT: HeadingGroupedLayout = HeadingGroupedLayout {
    heading: "h3.text-h4.-rs-style20.box",
    container_tag: "div",
    container_class: "box",
    fixture: "div.event-group.-layout1",
    row: "ul.row-table.event",
    cell: "li",
    detail: "p.event-detail",
};

#[derive(Debug)]
pub struct HeadingGroupedAdapter {
    source_id: &'static str,
    date_label_style: DateLabelStyle,
    container_tag: &'static str,
    container_class: &'static str,
    heading: Selector,
    fixture: Selector,
    row: Selector,
    cell: Selector,
    detail: Selector,
}

impl HeadingGroupedAdapter {
    pub fn new(
        source_id: &'static str,
        date_label_style: DateLabelStyle,
        layout: HeadingGroupedLayout,
    ) -> Result<Self, AdapterError> {
        Ok(Self {
            source_id,
            date_label_style,
            container_tag: layout.container_tag,
            container_class: layout.container_class,
            heading: parse_selector(layout.heading)?,
            fixture: parse_selector(layout.fixture)?,
            row: parse_selector(layout.row)?,
            cell: parse_selector(layout.cell)?,
            detail: parse_selector(layout.detail)?,
        })
    }

    /// Nearest following sibling container, unless another heading comes
    /// first.
    fn following_container<'a>(&self, heading: ElementRef<'a>) -> Option<ElementRef<'a>> {
        heading
            .next_siblings()
            .filter_map(ElementRef::wrap)
            .take_while(|el| !self.heading.matches(el))
            .find(|el| el.value().name() == self.container_tag && has_class(*el, self.container_class))
    }

    fn parse_fixture(&self, group: ElementRef<'_>, date_label: &str) -> Option<RawFixture> {
        let Some(row) = group.select(&self.row).next() else {
            debug!(source_id = self.source_id, date_label, "fixture group without a row");
            return None;
        };
        let mut cells = row.select(&self.cell).map(element_text);
        let (Some(home_team), Some(time), Some(away_team)) = (cells.next(), cells.next(), cells.next()) else {
            debug!(source_id = self.source_id, date_label, "fixture row with fewer than three cells");
            return None;
        };
        let (competition, channel) = group
            .select(&self.detail)
            .next()
            .map(|p| split_detail(&element_text(p)))
            .unwrap_or_default();

        Some(RawFixture {
            date_label: date_label.to_string(),
            time,
            home_team,
            away_team,
            competition,
            channel,
        })
    }
}

impl SourceAdapter for HeadingGroupedAdapter {
    fn source_id(&self) -> &'static str {
        self.source_id
    }

    fn date_label_style(&self) -> DateLabelStyle {
        self.date_label_style
    }

    fn extract<'a>(&'a self, document: &'a Html) -> Box<dyn Iterator<Item = RawFixture> + 'a> {
        Box::new(document.select(&self.heading).flat_map(move |heading| {
            let date_label = element_text(heading);
            self.following_container(heading)
                .into_iter()
                .flat_map(move |container| container.select(&self.fixture))
                .filter_map(move |group| self.parse_fixture(group, &date_label))
        }))
    }
}

/// Selectors for listings where date rows and fixture rows are interleaved
/// children of one container.
#[derive(Debug, Clone, Copy)]
pub struct FlatGroupedLayout {
    pub container: &'static str,
    pub child_tag: &'static str,
    pub date_class: &'static str,
    pub fixture_class: &'static str,
    pub time: &'static str,
    pub teams: &'static str,
    pub competition: &'static str,
    pub channel: &'static str,
}

pub const LIVE_FOOTBALL_ON_TV_LAYOUT: FlatGroupedLayout = FlatGroupedLayout {
    container: "div.fixture-group",
    child_tag: "div",
    date_class: "fixture-date",
    fixture_class: "fixture",
    time: "div.fixture__time",
    teams: "div.fixture__teams",
    competition: "div.fixture__competition",
    channel: "div.fixture__channel",
};

#[derive(Debug)]
pub struct FlatGroupedAdapter {
    source_id: &'static str,
    date_label_style: DateLabelStyle,
    child_tag: &'static str,
    date_class: &'static str,
    fixture_class: &'static str,
    container: Selector,
    time: Selector,
    teams: Selector,
    competition: Selector,
    channel: Selector,
}

impl FlatGroupedAdapter {
    pub fn new(
        source_id: &'static str,
        date_label_style: DateLabelStyle,
        layout: FlatGroupedLayout,
    ) -> Result<Self, AdapterError> {
        Ok(Self {
            source_id,
            date_label_style,
            child_tag: layout.child_tag,
            date_class: layout.date_class,
            fixture_class: layout.fixture_class,
            container: parse_selector(layout.container)?,
            time: parse_selector(layout.time)?,
            teams: parse_selector(layout.teams)?,
            competition: parse_selector(layout.competition)?,
            channel: parse_selector(layout.channel)?,
        })
    }

    /// One fold step over the container's children. Date rows replace the
    /// running label; fixture rows yield a record under it.
    fn step(&self, current_date: &mut Option<String>, child: ElementRef<'_>) -> Option<RawFixture> {
        if has_class(child, self.date_class) {
            *current_date = Some(element_text(child));
            return None;
        }
        if !has_class(child, self.fixture_class) {
            return None;
        }
        let Some(date_label) = current_date.as_deref() else {
            debug!(source_id = self.source_id, "fixture before any date row");
            return None;
        };

        let (Some(time), Some(teams)) = (first_text(child, &self.time), first_text(child, &self.teams)) else {
            debug!(source_id = self.source_id, date_label, "fixture missing time or teams");
            return None;
        };
        let (home_team, away_team) = split_teams(&teams);

        Some(RawFixture {
            date_label: date_label.to_string(),
            time,
            home_team,
            away_team,
            competition: first_text(child, &self.competition).unwrap_or_default(),
            channel: first_text(child, &self.channel).unwrap_or_default(),
        })
    }
}

impl SourceAdapter for FlatGroupedAdapter {
    fn source_id(&self) -> &'static str {
        self.source_id
    }

    fn date_label_style(&self) -> DateLabelStyle {
        self.date_label_style
    }

    fn extract<'a>(&'a self, document: &'a Html) -> Box<dyn Iterator<Item = RawFixture> + 'a> {
        Box::new(document.select(&self.container).flat_map(move |group| {
            group
                .children()
                .filter_map(ElementRef::wrap)
                .filter(move |child| child.value().name() == self.child_tag)
                .scan(None, move |current_date, child| Some(self.step(current_date, child)))
                .flatten()
        }))
    }
}

pub fn skysports_adapter() -> Result<HeadingGroupedAdapter, AdapterError> {
    HeadingGroupedAdapter::new(SKYSPORTS_SOURCE_ID, DateLabelStyle::YearElided, SKYSPORTS_LAYOUT)
}

pub fn live_football_on_tv_adapter() -> Result<FlatGroupedAdapter, AdapterError> {
    FlatGroupedAdapter::new(
        LIVE_FOOTBALL_ON_TV_SOURCE_ID,
        DateLabelStyle::ExplicitYear,
        LIVE_FOOTBALL_ON_TV_LAYOUT,
    )
}

pub fn adapter_for_source(source_id: &str) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    match source_id {
        SKYSPORTS_SOURCE_ID => Ok(Box::new(skysports_adapter()?)),
        LIVE_FOOTBALL_ON_TV_SOURCE_ID => Ok(Box::new(live_football_on_tv_adapter()?)),
        other => Err(AdapterError::UnknownSource(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SKY_TWO_FIXTURES: &str = r#"
        <html><body>
          <h3 class="text-h4 -rs-style20 box">Thu 4th December</h3>
          <div class="box">
            <div class="event-group -layout1">
              <ul class="row-table event">
                <li>Arsenal</li><li>20:00</li><li>Chelsea</li>
              </ul>
              <p class="event-detail">Premier League, Sky Sports Main Event</p>
            </div>
            <div class="event-group -layout1">
              <ul class="row-table event">
                <li>Leeds United</li><li>19:45</li><li>Hull City</li>
              </ul>
            </div>
          </div>
        </body></html>
    "#;

    fn raw(date: &str, time: &str, home: &str, away: &str, comp: &str, channel: &str) -> RawFixture {
        RawFixture {
            date_label: date.into(),
            time: time.into(),
            home_team: home.into(),
            away_team: away.into(),
            competition: comp.into(),
            channel: channel.into(),
        }
    }

    #[test]
    fn heading_grouped_yields_fixtures_under_their_heading() {
        let adapter = skysports_adapter().unwrap();
        let got = extract_page(&adapter, SKY_TWO_FIXTURES);
        assert_eq!(
            got,
            vec![
                raw("Thu 4th December", "20:00", "Arsenal", "Chelsea", "Premier League", "Sky Sports Main Event"),
                raw("Thu 4th December", "19:45", "Leeds United", "Hull City", "", ""),
            ]
        );
    }

    #[test]
    fn heading_grouped_skips_short_rows_and_missing_containers() {
        let html = r#"
            <h3 class="text-h4 -rs-style20 box">Fri 5th December</h3>
            <p>no container here</p>
            <h3 class="text-h4 -rs-style20 box">Sat 6th December</h3>
            <span>spacer</span>
            <div class="box">
              <div class="event-group -layout1">
                <ul class="row-table event"><li>Everton</li><li>15:00</li></ul>
              </div>
              <div class="event-group -layout1"><p class="event-detail">EFL, Sky Sports+</p></div>
              <div class="event-group -layout1">
                <ul class="row-table event"><li>Everton</li><li>17:30</li><li>Fulham</li></ul>
                <p class="event-detail">Premier League</p>
              </div>
            </div>
        "#;
        let adapter = skysports_adapter().unwrap();
        let got = extract_page(&adapter, html);
        assert_eq!(
            got,
            vec![raw("Sat 6th December", "17:30", "Everton", "Fulham", "Premier League", "")]
        );
    }

    #[test]
    fn detail_line_splits_on_first_comma_only() {
        assert_eq!(
            split_detail("Carabao Cup, Sky Sports Football, Sky Sports Main Event"),
            (
                "Carabao Cup".to_string(),
                "Sky Sports Football, Sky Sports Main Event".to_string()
            )
        );
        assert_eq!(split_detail(" SPFL "), ("SPFL".to_string(), String::new()));
    }

    const TNT_GROUP: &str = r#"
        <div class="fixture-group">
          <div class="anchor"></div>
          <div class="fixture">
            <div class="fixture__time">12:00</div>
            <div class="fixture__teams">Orphan v Fixture</div>
          </div>
          <div class="fixture-date">Tuesday 25th November 2025</div>
          <div class="fixture">
            <div class="fixture__time">20:00</div>
            <div class="fixture__teams">Celtic v Rangers</div>
            <div class="fixture__competition">Scottish Premiership</div>
            <div class="fixture__channel">TNT Sports 1</div>
          </div>
          <div class="fixture">
            <div class="fixture__teams">Hearts v Hibs</div>
            <div class="fixture__channel">TNT Sports 2</div>
          </div>
          <div class="anchor"></div>
          <div class="fixture-date">Wednesday 26th November 2025</div>
          <div class="fixture">
            <div class="fixture__time">17:45</div>
            <div class="fixture__teams">Ajax vs Benfica</div>
          </div>
        </div>
    "#;

    #[test]
    fn flat_grouped_carries_current_date_forward() {
        let adapter = live_football_on_tv_adapter().unwrap();
        let got = extract_page(&adapter, TNT_GROUP);
        assert_eq!(
            got,
            vec![
                raw(
                    "Tuesday 25th November 2025",
                    "20:00",
                    "Celtic",
                    "Rangers",
                    "Scottish Premiership",
                    "TNT Sports 1"
                ),
                raw("Wednesday 26th November 2025", "17:45", "Ajax", "Benfica", "", ""),
            ]
        );
    }

    #[test]
    fn flat_grouped_fixture_missing_time_is_dropped() {
        let adapter = live_football_on_tv_adapter().unwrap();
        let document = Html::parse_document(TNT_GROUP);
        let fixture_rows = document
            .select(&Selector::parse("div.fixture-group > div.fixture").unwrap())
            .count();
        let extracted = adapter.extract(&document).count();
        // one row lacks a time, one precedes any date row
        assert_eq!(fixture_rows, 4);
        assert_eq!(extracted, fixture_rows - 2);
    }

    #[test]
    fn current_date_does_not_leak_between_groups() {
        let html = r#"
            <div class="fixture-group">
              <div class="fixture-date">Saturday 29th November 2025</div>
            </div>
            <div class="fixture-group">
              <div class="fixture">
                <div class="fixture__time">15:00</div>
                <div class="fixture__teams">Leeds v Hull</div>
              </div>
            </div>
        "#;
        let adapter = live_football_on_tv_adapter().unwrap();
        assert!(extract_page(&adapter, html).is_empty());
    }

    #[test]
    fn flat_grouped_only_walks_direct_children() {
        let html = r#"
            <div class="fixture-group">
              <div class="fixture-date">Saturday 29th November 2025</div>
              <section>
                <div class="fixture">
                  <div class="fixture__time">15:00</div>
                  <div class="fixture__teams">Nested v Row</div>
                </div>
              </section>
            </div>
        "#;
        let adapter = live_football_on_tv_adapter().unwrap();
        assert!(extract_page(&adapter, html).is_empty());
    }

    #[test]
    fn registry_binds_sources_to_their_adapter() {
        let sky = adapter_for_source(SKYSPORTS_SOURCE_ID).unwrap();
        assert_eq!(sky.source_id(), SKYSPORTS_SOURCE_ID);
        assert_eq!(sky.date_label_style(), DateLabelStyle::YearElided);

        let tnt = adapter_for_source(LIVE_FOOTBALL_ON_TV_SOURCE_ID).unwrap();
        assert_eq!(tnt.date_label_style(), DateLabelStyle::ExplicitYear);

        assert!(matches!(
            adapter_for_source("bbc"),
            Err(AdapterError::UnknownSource(id)) if id == "bbc"
        ));
    }

    #[test]
    fn invalid_layout_selector_is_reported() {
        let layout = HeadingGroupedLayout {
            heading: "h3[",
            ..SKYSPORTS_LAYOUT
        };
        let err = HeadingGroupedAdapter::new("broken", DateLabelStyle::YearElided, layout).unwrap_err();
        assert!(matches!(err, AdapterError::InvalidSelector { .. }));
    }
}
