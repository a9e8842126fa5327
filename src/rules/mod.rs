//! Rule definitions, text normalisation and the rule matcher.

pub mod matcher;
pub mod model;
pub mod normalize;

pub use matcher::{first_match, keywords_all_present, matches};
pub use model::{NewRule, ReadFilter, Rule, RuleConditions};
pub use normalize::normalize;
