//! Go Dispatcher Opt-out Module
//!
//! Keyword matching that decides whether an inbound message is a request
//! to stop receiving messages.

use std::collections::HashSet;

use crate::config::OptOutConfig;
use crate::protocol::OptOutMetadata;

/// Matches message content against the configured opt-out keywords
#[derive(Debug, Clone)]
pub struct OptOutMatcher {
    keywords: HashSet<String>,
    case_sensitive: bool,
}

impl OptOutMatcher {
    pub fn new(config: &OptOutConfig) -> Self {
        let keywords = config
            .keywords
            .iter()
            .map(|k| {
                let k = k.trim();
                if config.case_sensitive {
                    k.to_string()
                } else {
                    k.to_lowercase()
                }
            })
            .collect();

        Self {
            keywords,
            case_sensitive: config.case_sensitive,
        }
    }

    /// Decision for a piece of content. Always returns an annotation, even
    /// when the message is not an opt-out.
    pub fn check(&self, content: Option<&str>) -> OptOutMetadata {
        let content = content.unwrap_or("").trim();
        let keyword = if self.case_sensitive {
            content.to_string()
        } else {
            content.to_lowercase()
        };

        if !keyword.is_empty() && self.keywords.contains(&keyword) {
            OptOutMetadata {
                optout: true,
                optout_keyword: Some(keyword),
            }
        } else {
            OptOutMetadata::default()
        }
    }
}
