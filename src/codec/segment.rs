//! Pre-freeze text segmentation.
//!
//! Chinese sources get whitespace inserted between glyph clusters so the
//! freezer's patterns see stable word boundaries. Everything else passes
//! through untouched. The seam is a trait so a dictionary-based segmenter
//! can be plugged in without touching the codec.

/// Splits text into glyph clusters ahead of freezing.
///
/// Implementations must be idempotent: `segment(segment(t)) == segment(t)`.
pub trait Segmenter: Send + Sync {
    fn segment(&self, text: &str, source_lang: &str) -> String;
}

/// Pass-through segmenter for languages with explicit word boundaries.
#[derive(Debug, Default)]
pub struct IdentitySegmenter;

impl Segmenter for IdentitySegmenter {
    fn segment(&self, text: &str, _source_lang: &str) -> String {
        text.to_string()
    }
}

/// Inserts a single space at boundaries between CJK and non-CJK clusters.
///
/// Only active for source languages whose code starts with `zh`; other
/// languages pass through.
#[derive(Debug, Default)]
pub struct WhitespaceSegmenter;

fn is_cjk(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}

impl Segmenter for WhitespaceSegmenter {
    fn segment(&self, text: &str, source_lang: &str) -> String {
        if !source_lang.starts_with("zh") {
            return text.to_string();
        }
        let mut out = String::with_capacity(text.len() + 16);
        let mut prev: Option<char> = None;
        for c in text.chars() {
            if let Some(p) = prev {
                let boundary = is_cjk(p) != is_cjk(c)
                    && !p.is_whitespace()
                    && !c.is_whitespace()
                    && !c.is_ascii_punctuation()
                    && !p.is_ascii_punctuation();
                if boundary {
                    out.push(' ');
                }
            }
            out.push(c);
            prev = Some(c);
        }
        out
    }
}

/// Pick the segmenter for a source language.
pub fn segmenter_for(source_lang: &str) -> Box<dyn Segmenter> {
    if source_lang.starts_with("zh") {
        Box::new(WhitespaceSegmenter)
    } else {
        Box::new(IdentitySegmenter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_passthrough() {
        let s = IdentitySegmenter;
        assert_eq!(s.segment("Hello {0}", "en-US"), "Hello {0}");
    }

    #[test]
    fn test_whitespace_inactive_for_non_zh() {
        let s = WhitespaceSegmenter;
        assert_eq!(s.segment("攻击force", "ja-JP"), "攻击force");
    }

    #[test]
    fn test_whitespace_inserts_at_cluster_boundary() {
        let s = WhitespaceSegmenter;
        assert_eq!(s.segment("攻击force提升", "zh-CN"), "攻击 force 提升");
    }

    #[test]
    fn test_whitespace_idempotent() {
        let s = WhitespaceSegmenter;
        let once = s.segment("攻击force提升10点", "zh-CN");
        let twice = s.segment(&once, "zh-CN");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_whitespace_preserves_punctuation_runs() {
        let s = WhitespaceSegmenter;
        let out = s.segment("伤害+10%", "zh-CN");
        // Punctuation does not force a boundary.
        assert_eq!(out, "伤害+10%");
    }

    #[test]
    fn test_segmenter_for_dispatch() {
        let zh = segmenter_for("zh-CN");
        let en = segmenter_for("en-US");
        assert_eq!(zh.segment("你好world", "zh-CN"), "你好 world");
        assert_eq!(en.segment("你好world", "en-US"), "你好world");
    }
}
