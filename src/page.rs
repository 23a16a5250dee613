// src/page.rs
/// One page of a typed paged query: the decoded rows plus the key to
/// resume from. `next_key` is `None` only when the scan is exhausted.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResultPage<R, K> {
    pub results: Vec<R>,
    pub next_key: Option<K>,
}
