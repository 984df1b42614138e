// ── Consumer interest filters ──
//
// A filter is a category plus optional entity selectors. It is fixed at
// subscribe time and evaluated against the event header only, never the
// payload.

use std::fmt;

use halink_api::{Category, EventHeader};

use crate::error::CoreError;

/// Domains recognized when resolving plural aliases (`lights` → `light`).
/// Anything else is taken literally.
const KNOWN_DOMAINS: &[&str] = &[
    "alarm_control_panel",
    "automation",
    "binary_sensor",
    "button",
    "calendar",
    "camera",
    "climate",
    "cover",
    "device_tracker",
    "fan",
    "humidifier",
    "input_boolean",
    "input_button",
    "input_datetime",
    "input_number",
    "input_select",
    "input_text",
    "light",
    "lock",
    "media_player",
    "number",
    "person",
    "remote",
    "scene",
    "script",
    "select",
    "sensor",
    "siren",
    "switch",
    "text",
    "update",
    "vacuum",
    "valve",
    "water_heater",
    "weather",
    "zone",
];

/// One entity selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Any event that concerns an entity.
    AnyEntity,
    /// Every entity of a domain, e.g. `light`.
    Domain(String),
    /// One entity, e.g. `light.kitchen`.
    Entity(String),
    /// Entity ids starting with a prefix, e.g. `light.kitchen_`.
    Prefix(String),
}

impl Selector {
    fn matches(&self, header: &EventHeader) -> bool {
        match self {
            Self::AnyEntity => header.entity_id.is_some(),
            Self::Domain(domain) => header.domain.as_deref() == Some(domain.as_str()),
            Self::Entity(entity) => header.entity_id.as_deref() == Some(entity.as_str()),
            Self::Prefix(prefix) => header
                .entity_id
                .as_deref()
                .is_some_and(|id| id.starts_with(prefix.as_str())),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AnyEntity => f.write_str("*"),
            Self::Domain(domain) => f.write_str(domain),
            Self::Entity(entity) => f.write_str(entity),
            Self::Prefix(prefix) => write!(f, "{prefix}*"),
        }
    }
}

/// Immutable interest of one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    category: Category,
    selectors: Vec<Selector>,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::for_category(Category::state_changed())
    }
}

impl EventFilter {
    /// Every event of `category`.
    pub fn for_category(category: Category) -> Self {
        Self {
            category,
            selectors: Vec::new(),
        }
    }

    /// Parse a comma-separated selector list for `state_changed` events:
    /// `light`, `lights`, `light.kitchen`, `light.kitchen_*`, `*`.
    /// An empty expression selects everything in the category.
    pub fn parse(expression: &str) -> Result<Self, CoreError> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }
        let selectors = trimmed
            .split(',')
            .map(|token| parse_selector(expression, token.trim()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            category: Category::state_changed(),
            selectors,
        })
    }

    /// Same selectors, different category.
    pub fn with_category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    pub fn category(&self) -> &Category {
        &self.category
    }

    pub fn selectors(&self) -> &[Selector] {
        &self.selectors
    }

    /// Whether an event with this header is of interest. Category
    /// matching is done by the fan-out manager.
    pub fn matches(&self, header: &EventHeader) -> bool {
        self.selectors.is_empty() || self.selectors.iter().any(|s| s.matches(header))
    }
}

impl fmt::Display for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.category.as_str())?;
        if !self.selectors.is_empty() {
            let list: Vec<String> = self.selectors.iter().map(ToString::to_string).collect();
            write!(f, "[{}]", list.join(","))?;
        }
        Ok(())
    }
}

fn parse_selector(expression: &str, token: &str) -> Result<Selector, CoreError> {
    let invalid = |reason: String| CoreError::InvalidFilter {
        expression: expression.to_owned(),
        reason,
    };

    if token.is_empty() {
        return Err(invalid("empty selector".into()));
    }
    if let Some(bad) = token
        .chars()
        .find(|&c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '*')))
    {
        return Err(invalid(format!("unexpected character '{bad}' in '{token}'")));
    }
    if token == "*" {
        return Ok(Selector::AnyEntity);
    }

    let (stem, wildcard) = match token.strip_suffix('*') {
        Some(stem) => (stem, true),
        None => (token, false),
    };
    if stem.contains('*') {
        return Err(invalid(format!("'*' is only allowed at the end of '{token}'")));
    }
    if stem.matches('.').count() > 1 {
        return Err(invalid(format!("'{token}' has more than one '.'")));
    }

    if wildcard {
        return Ok(Selector::Prefix(stem.to_owned()));
    }

    match stem.split_once('.') {
        Some((domain, object)) if !domain.is_empty() && !object.is_empty() => {
            Ok(Selector::Entity(stem.to_owned()))
        }
        Some(_) => Err(invalid(format!("'{token}' is not a valid entity id"))),
        None => Ok(Selector::Domain(resolve_domain(stem))),
    }
}

/// Map plural aliases onto known domains.
fn resolve_domain(token: &str) -> String {
    if KNOWN_DOMAINS.contains(&token) {
        return token.to_owned();
    }
    for suffix in ["s", "es"] {
        if let Some(singular) = token.strip_suffix(suffix) {
            if KNOWN_DOMAINS.contains(&singular) {
                return singular.to_owned();
            }
        }
    }
    token.to_owned()
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn header(entity_id: Option<&str>) -> EventHeader {
        EventHeader {
            event_type: "state_changed".into(),
            entity_id: entity_id.map(str::to_owned),
            domain: entity_id
                .and_then(|id| id.split_once('.'))
                .map(|(d, _)| d.to_owned()),
            time_fired: None,
        }
    }

    #[test]
    fn plural_aliases_resolve_to_domains() {
        let filter = EventFilter::parse("lights, switches,sensors,binary_sensors").unwrap();
        assert_eq!(
            filter.selectors(),
            &[
                Selector::Domain("light".into()),
                Selector::Domain("switch".into()),
                Selector::Domain("sensor".into()),
                Selector::Domain("binary_sensor".into()),
            ]
        );
        assert_eq!(filter.category(), &Category::state_changed());
    }

    #[test]
    fn unknown_domains_are_taken_literally() {
        let filter = EventFilter::parse("hacs_things").unwrap();
        assert_eq!(filter.selectors(), &[Selector::Domain("hacs_things".into())]);
    }

    #[test]
    fn lights_filter_matches_only_lights() {
        let filter = EventFilter::parse("lights").unwrap();
        assert!(filter.matches(&header(Some("light.kitchen"))));
        assert!(!filter.matches(&header(Some("switch.porch"))));
        assert!(!filter.matches(&header(None)));
    }

    #[test]
    fn entity_prefix_and_wildcard() {
        let filter = EventFilter::parse("light.kitchen_*,switch.porch").unwrap();
        assert!(filter.matches(&header(Some("light.kitchen_island"))));
        assert!(filter.matches(&header(Some("switch.porch"))));
        assert!(!filter.matches(&header(Some("light.bedroom"))));

        let any = EventFilter::parse("*").unwrap();
        assert!(any.matches(&header(Some("vacuum.roomba"))));
        assert!(!any.matches(&header(None)));
    }

    #[test]
    fn empty_expression_matches_whole_category() {
        let filter = EventFilter::parse("  ").unwrap();
        assert!(filter.selectors().is_empty());
        assert!(filter.matches(&header(None)));
    }

    #[test]
    fn invalid_expressions_are_rejected() {
        for expression in [
            "Light",
            "light,,switch",
            "light.*kitchen",
            "light.kitchen.extra",
            "light.",
            ".kitchen",
            "light kitchen",
            "*light",
        ] {
            let err = EventFilter::parse(expression).unwrap_err();
            assert!(
                matches!(err, CoreError::InvalidFilter { expression: ref e, .. } if e == expression),
                "{expression}: {err:?}"
            );
        }
    }

    #[test]
    fn display_round_trips_selectors() {
        let filter = EventFilter::parse("lights,light.kitchen_*")
            .unwrap()
            .with_category(Category::new("call_service"));
        assert_eq!(filter.to_string(), "call_service[light,light.kitchen_*]");
        assert_eq!(EventFilter::default().to_string(), "state_changed");
    }
}
