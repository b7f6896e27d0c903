//! Bus topics. Each agent consumes exactly one request topic and replies
//! on its canonical `.response` counterpart.

pub const DECOMPOSE: &str = "research.decompose";
pub const PLAN: &str = "research.plan";
pub const SEARCH: &str = "search.request";
pub const AGGREGATE: &str = "research.aggregate";
pub const SUMMARIZE: &str = "summarization.request";
pub const REASON: &str = "reasoning.request";
pub const ARTIFACT: &str = "artifact.request";
