use serde::{Deserialize, Serialize};

/// One generated piece of content: a short-form video or carousel concept.
///
/// Every field is optional because the model is free to omit any of them;
/// an item is valid as long as it is a well-formed JSON object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slides: Option<Vec<Slide>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broll_query: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slide {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broll_query: Option<String>,
}

impl ParsedItem {
    pub fn slide_count(&self) -> usize {
        self.slides.as_ref().map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_item() {
        let json = r#"{
            "hook": "This kitchen sold the house",
            "caption": "Open house Sunday",
            "slides": [{"header": "Before", "body": "Dated tile", "brollQuery": "old kitchen"}],
            "brollQuery": "modern kitchen"
        }"#;
        let item: ParsedItem = serde_json::from_str(json).unwrap();
        assert_eq!(item.hook.as_deref(), Some("This kitchen sold the house"));
        assert_eq!(item.slide_count(), 1);
        assert_eq!(item.slides.as_ref().unwrap()[0].broll_query.as_deref(), Some("old kitchen"));
        assert_eq!(item.broll_query.as_deref(), Some("modern kitchen"));
    }

    #[test]
    fn missing_fields_are_none() {
        let item: ParsedItem = serde_json::from_str(r#"{"caption":"only this"}"#).unwrap();
        assert!(item.hook.is_none());
        assert!(item.slides.is_none());
        assert_eq!(item.caption.as_deref(), Some("only this"));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let item: ParsedItem = serde_json::from_str(r#"{"hook":"h","mood":"upbeat"}"#).unwrap();
        assert_eq!(item.hook.as_deref(), Some("h"));
    }

    #[test]
    fn wrong_field_type_is_rejected() {
        assert!(serde_json::from_str::<ParsedItem>(r#"{"hook":42}"#).is_err());
    }

    #[test]
    fn serializes_camel_case_without_nulls() {
        let item = ParsedItem {
            broll_query: Some("drone shot".into()),
            ..Default::default()
        };
        let json = serde_json::to_string(&item).unwrap();
        assert_eq!(json, r#"{"brollQuery":"drone shot"}"#);
    }
}
