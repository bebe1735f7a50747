use std::sync::Arc;

use crate::config::DEFAULT_CLASSES;

/// Label rendered for class ids outside the configured table.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Class-id to display-name table shared between detector and annotator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassLabels {
    names: Arc<[String]>,
}

impl ClassLabels {
    pub fn new(names: Vec<String>) -> Self {
        Self {
            names: names.into(),
        }
    }

    /// Display name for `class_id`; `"unknown"` when out of range.
    pub fn name(&self, class_id: usize) -> &str {
        self.names
            .get(class_id)
            .map(String::as_str)
            .unwrap_or(UNKNOWN_LABEL)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for ClassLabels {
    fn default() -> Self {
        Self::new(DEFAULT_CLASSES.iter().map(|c| c.to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_and_unknown_ids() {
        let labels = ClassLabels::default();
        assert_eq!(labels.name(0), "pothole");
        assert_eq!(labels.name(2), "speed bump");
        assert_eq!(labels.name(3), "unknown");
        assert_eq!(labels.name(usize::MAX), "unknown");
    }
}
