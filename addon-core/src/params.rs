//! A port of request parameter *Optionals from apimachinery/types.go
use crate::labels::Selector;

/// Common query parameters used in list/watch calls on collections
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListParams {
    /// A selector to restrict the list of returned objects by their labels.
    ///
    /// Defaults to everything if `None`.
    pub label_selector: Option<Selector>,
}

impl ListParams {
    /// Configure the selector to restrict the list of returned objects by their labels.
    pub fn labels(mut self, label_selector: &str) -> Result<Self, crate::labels::SelectorError> {
        self.label_selector = Some(label_selector.parse()?);
        Ok(self)
    }

    /// Configure typed label selectors
    #[must_use]
    pub fn labels_from(mut self, selector: &Selector) -> Self {
        self.label_selector = Some(selector.clone());
        self
    }

    /// Whether an object with the given labels passes the filters
    pub fn matches(&self, labels: &std::collections::BTreeMap<String, String>) -> bool {
        self.label_selector.as_ref().map_or(true, |s| s.matches(labels))
    }
}
