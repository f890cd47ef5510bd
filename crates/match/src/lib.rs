pub mod matcher;
pub mod normalize;

pub use matcher::{CategorySuggestion, MatchKind, PatternMatch, PatternMatcher};
pub use normalize::{jaccard_score, normalize_description, token_set};
