//! Post-execution output handling: classify, redact, truncate, format.
//!
//! The one non-negotiable rule lives here: detected classification is never
//! upgraded past the channel ceiling. Output that exceeds the ceiling is
//! replaced wholesale with a redaction notice; nothing of the original body
//! leaves the process toward that channel.

use crate::audit::{AuditEvent, AuditSink};
use crate::config::FilterConfig;
use cg_channels::Classification;

const TRUNCATION_NOTICE: &str = "\n[output truncated for transport]";

#[derive(Debug, Clone)]
struct MarkerRule {
    classification: Classification,
    patterns: Vec<String>,
}

pub struct ResponseFilter {
    /// Sorted highest classification first so detection returns the highest
    /// matching level.
    markers: Vec<MarkerRule>,
    max_reply_chars: usize,
    full_access_url: String,
}

impl ResponseFilter {
    pub fn new(config: &FilterConfig) -> Self {
        let mut markers: Vec<MarkerRule> = config
            .markers
            .iter()
            .map(|rule| MarkerRule {
                classification: rule.classification,
                patterns: rule
                    .patterns
                    .iter()
                    .map(|pattern| pattern.trim().to_string())
                    .filter(|pattern| !pattern.is_empty())
                    .collect(),
            })
            .filter(|rule| !rule.patterns.is_empty())
            .collect();
        markers.sort_by(|left, right| right.classification.cmp(&left.classification));
        Self {
            markers,
            max_reply_chars: config.max_reply_chars.max(200),
            full_access_url: config.full_access_url.clone(),
        }
    }

    /// Highest sensitivity level whose marker appears in the text; `Public`
    /// when nothing matches.
    pub fn detect_classification(&self, text: &str) -> Classification {
        for rule in &self.markers {
            if rule.patterns.iter().any(|pattern| text.contains(pattern)) {
                return rule.classification;
            }
        }
        Classification::Public
    }

    /// Returns the deliverable text, whether redaction happened, and the
    /// detected level. The original body is dropped entirely when it exceeds
    /// the channel ceiling.
    pub fn filter(
        &self,
        text: &str,
        channel_max: Classification,
        envelope_id: &str,
        audit: &dyn AuditSink,
    ) -> (String, bool, Classification) {
        let detected = self.detect_classification(text);
        if detected <= channel_max {
            return (text.to_string(), false, detected);
        }

        audit.log_event(
            AuditEvent::new(
                "redaction",
                envelope_id,
                "output_withheld",
                format!(
                    "output classified {} exceeds channel clearance {}",
                    detected, channel_max
                ),
            ),
        );
        tracing::warn!(
            envelope_id,
            detected = %detected,
            channel_max = %channel_max,
            "command output withheld from channel"
        );
        let notice = format!(
            "Output withheld: content was classified {} which exceeds this channel's clearance. View the full result at {}",
            detected, self.full_access_url
        );
        (notice, true, detected)
    }

    pub fn truncate(&self, text: &str) -> String {
        if text.chars().count() <= self.max_reply_chars {
            return text.to_string();
        }
        let keep = self
            .max_reply_chars
            .saturating_sub(TRUNCATION_NOTICE.chars().count());
        let mut out: String = text.chars().take(keep).collect();
        out.push_str(TRUNCATION_NOTICE);
        out
    }

    /// Cosmetic footer with execution metadata; never affects security
    /// decisions.
    pub fn format(
        &self,
        text: &str,
        command: &str,
        elapsed_ms: u64,
        audit_id: &str,
        include_timing: bool,
        include_audit_id: bool,
    ) -> String {
        let mut footer_parts = vec![command.to_string()];
        if include_timing {
            footer_parts.push(format!("{elapsed_ms}ms"));
        }
        if include_audit_id {
            footer_parts.push(format!("audit {audit_id}"));
        }
        format!("{text}\n[{}]", footer_parts.join(" | "))
    }
}

#[cfg(test)]
mod tests {
    use super::ResponseFilter;
    use crate::audit::MemoryAuditSink;
    use crate::config::FilterConfig;
    use cg_channels::Classification;

    fn filter() -> ResponseFilter {
        ResponseFilter::new(&FilterConfig::default())
    }

    #[test]
    fn detection_returns_highest_matching_level() {
        let filter = filter();
        assert_eq!(
            filter.detect_classification("all systems nominal"),
            Classification::Public
        );
        assert_eq!(
            filter.detect_classification("INTERNAL// deploy notes"),
            Classification::Internal
        );
        // Both markers present: the higher one wins.
        assert_eq!(
            filter.detect_classification("INTERNAL// and RESTRICTED// findings"),
            Classification::Restricted
        );
    }

    #[test]
    fn output_at_or_below_ceiling_passes_through_unchanged() {
        let filter = filter();
        let audit = MemoryAuditSink::default();
        let (text, was_filtered, detected) = filter.filter(
            "INTERNAL// build report",
            Classification::Internal,
            "env-1",
            &audit,
        );
        assert_eq!(text, "INTERNAL// build report");
        assert!(!was_filtered);
        assert_eq!(detected, Classification::Internal);
        assert!(audit.events().is_empty());
    }

    #[test]
    fn over_classified_output_is_fully_redacted_and_audited() {
        let filter = filter();
        let audit = MemoryAuditSink::default();
        let original = "RESTRICTED// scanner credentials: abc123";
        let (text, was_filtered, detected) =
            filter.filter(original, Classification::Internal, "env-1", &audit);
        assert!(was_filtered);
        assert_eq!(detected, Classification::Restricted);
        assert!(!text.contains("abc123"));
        assert!(!text.contains("RESTRICTED//"));
        assert!(text.contains("exceeds this channel's clearance"));
        let events = audit.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "redaction");
    }

    #[test]
    fn classification_never_upgrades_for_any_level_pair() {
        let filter = filter();
        let audit = MemoryAuditSink::default();
        let levels = [
            Classification::Public,
            Classification::Internal,
            Classification::Confidential,
            Classification::Restricted,
        ];
        let marker_for = |level: Classification| match level {
            Classification::Public => "plain output",
            Classification::Internal => "INTERNAL// output",
            Classification::Confidential => "CONFIDENTIAL// output",
            Classification::Restricted => "RESTRICTED// output",
        };
        for detected_level in levels {
            for channel_max in levels {
                let body = marker_for(detected_level);
                let (text, was_filtered, detected) =
                    filter.filter(body, channel_max, "env-1", &audit);
                assert_eq!(detected, detected_level);
                if detected_level <= channel_max {
                    assert_eq!(text, body);
                    assert!(!was_filtered);
                } else {
                    assert!(was_filtered);
                    // Nothing above the ceiling survives in the reply.
                    for higher in levels.iter().filter(|l| **l > channel_max) {
                        assert!(!text.contains(marker_for(*higher)));
                    }
                }
            }
        }
    }

    #[test]
    fn truncate_caps_length_and_appends_notice() {
        let filter = ResponseFilter::new(&FilterConfig {
            max_reply_chars: 200,
            ..FilterConfig::default()
        });
        let long = "x".repeat(500);
        let out = filter.truncate(&long);
        assert!(out.chars().count() <= 200);
        assert!(out.ends_with("[output truncated for transport]"));
        assert_eq!(filter.truncate("short"), "short");
    }

    #[test]
    fn format_appends_metadata_footer() {
        let filter = filter();
        let out = filter.format("done", "platform-status", 142, "audit-1", true, true);
        assert!(out.starts_with("done\n"));
        assert!(out.contains("platform-status"));
        assert!(out.contains("142ms"));
        assert!(out.contains("audit audit-1"));

        let bare = filter.format("done", "platform-status", 142, "audit-1", false, false);
        assert!(!bare.contains("142ms"));
        assert!(!bare.contains("audit-1"));
    }
}
