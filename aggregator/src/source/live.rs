//! Live-web pseudo-source

use super::{IndexSource, QueryContext, SourceResult};
use async_trait::async_trait;
use cdxfed_shared::utils::time::now_timestamp;
use cdxfed_shared::{CaptureRecord, IndexError, IndexQuery, MatchType, IS_LIVE, LOAD_URL};

/// Always answers an exact query with one synthetic capture stamped "now"
/// whose load URL is the live URL itself.
#[derive(Debug, Default)]
pub struct LiveIndexSource;

impl LiveIndexSource {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl IndexSource for LiveIndexSource {
    fn kind(&self) -> &'static str {
        "live"
    }

    async fn query(&self, query: &IndexQuery, _ctx: &QueryContext) -> Result<SourceResult, IndexError> {
        if query.match_type != MatchType::Exact {
            return Ok(SourceResult::empty());
        }
        let mut record = CaptureRecord::new(query.urlkey.clone(), now_timestamp());
        record.url = Some(query.url.clone());
        record.set_extra(LOAD_URL, query.url.clone());
        record.set_extra(IS_LIVE, "true");
        Ok(SourceResult::from_vec(vec![record]))
    }
}
