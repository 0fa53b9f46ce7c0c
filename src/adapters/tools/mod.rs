pub mod search;

use crate::adapters::search::SearchService;
use crate::domain::ports::Tool;
use std::sync::Arc;

pub use search::SearchInternetTool;

/// The tool catalog exposed to models.
pub fn default_catalog(search: SearchService, max_results: usize) -> Vec<Arc<dyn Tool>> {
    vec![Arc::new(SearchInternetTool::new(search).with_max_results(max_results))]
}
