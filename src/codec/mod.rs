//! Placeholder codec: freeze source placeholders/tags into opaque tokens
//! and rehydrate the reverse.
//!
//! Freezing replaces runtime placeholders (`{0}`, `%s`, `<color=...>`) with
//! tokens like `⟦PH_1⟧` so the LLM cannot mangle them; rehydration restores
//! the original glyphs from the pass's placeholder map.

pub mod freeze;
pub mod map;
pub mod rehydrate;
pub mod schema;
pub mod segment;

pub use freeze::{detect_unbalanced, FreezeStats, PlaceholderFreezer};
pub use map::{PlaceholderMap, PlaceholderMapMetadata};
pub use rehydrate::{token_signature, Rehydrator};
pub use schema::{CompiledSchema, PairedTag, PatternKind, PlaceholderSchema};
pub use segment::{segmenter_for, IdentitySegmenter, Segmenter, WhitespaceSegmenter};
