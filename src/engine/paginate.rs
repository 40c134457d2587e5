//! Paginator - drive a module's page loop
//!
//! Two shapes: follow a `nextUrl` link out of each page, or count through a
//! numeric page parameter. Both dedup items by a caller-supplied key in
//! first-seen order (items without a key are dropped) and respect the stop
//! condition's page cap and empty-page rules. `nextUrl` additionally stops
//! on a revisited URL so a site linking back to page one cannot loop the
//! engine.

use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashSet;
use std::future::Future;

use crate::error::ReaderResult;
use crate::models::{PageParamPagination, PageStrategy, StopCondition};

pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// One loaded page in a `nextUrl` walk.
pub struct PageOutcome<T> {
    pub items: Vec<T>,
    pub next_url: Option<String>,
}

/// Walk pages by following each page's next link. The loader receives
/// `(url, page, page_index)` with `page` 1-based.
pub async fn paginate_next_url<T, F, Fut, K>(
    initial_url: String,
    stop: &StopCondition,
    mut load_page: F,
    key: K,
) -> ReaderResult<Vec<T>>
where
    F: FnMut(String, i64, i64) -> Fut,
    Fut: Future<Output = ReaderResult<PageOutcome<T>>>,
    K: Fn(&T) -> Option<String>,
{
    let max_pages = stop.max_pages();
    let mut visited = HashSet::new();
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut url = initial_url;
    let mut page = 0usize;

    while !url.is_empty() && page < max_pages {
        if !visited.insert(url.clone()) {
            tracing::debug!(url, "pagination cycle detected, stopping");
            break;
        }
        let outcome = load_page(url.clone(), page as i64 + 1, page as i64).await?;
        let page_was_empty = outcome.items.is_empty();
        dedup_into(&mut out, &mut seen, outcome.items, &key);

        if stop.stop_on_empty() && page_was_empty {
            break;
        }
        match outcome.next_url {
            Some(next) if !next.trim().is_empty() => url = next,
            _ => break,
        }
        page += 1;
    }
    Ok(out)
}

/// Count through page values `start, start+step, ...` up to the page cap.
/// The loader receives `(page_value, page, page_index)`.
pub async fn paginate_page_param<T, F, Fut, K>(
    cfg: &PageParamPagination,
    load_page: F,
    key: K,
) -> ReaderResult<Vec<T>>
where
    F: Fn(i64, i64, i64) -> Fut,
    Fut: Future<Output = ReaderResult<Vec<T>>>,
    K: Fn(&T) -> Option<String>,
{
    let stop = cfg.stop.clone().unwrap_or_default();
    let max_pages = stop.max_pages();
    let values: Vec<i64> = (0..max_pages as i64)
        .map(|i| cfg.page_param.start + i * cfg.page_param.step)
        .collect();

    let mut pages: Vec<Vec<T>> = match cfg.strategy {
        PageStrategy::Sequential => {
            let mut pages = Vec::new();
            for (index, value) in values.into_iter().enumerate() {
                let items = load_page(value, index as i64 + 1, index as i64).await?;
                let empty = items.is_empty();
                pages.push(items);
                if stop.stop_on_empty() && empty {
                    break;
                }
            }
            pages
        }
        PageStrategy::Parallel => {
            let concurrency = cfg.max_concurrent.unwrap_or(DEFAULT_MAX_CONCURRENT).max(1);
            stream::iter(
                values
                    .into_iter()
                    .enumerate()
                    .map(|(index, value)| load_page(value, index as i64 + 1, index as i64)),
            )
            .buffered(concurrency)
            .try_collect()
            .await?
        }
    };

    if stop.stop_on_empty() {
        if let Some(first_empty) = pages.iter().position(Vec::is_empty) {
            pages.truncate(first_empty);
        }
    }

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for items in pages {
        dedup_into(&mut out, &mut seen, items, &key);
    }
    Ok(out)
}

fn dedup_into<T, K>(out: &mut Vec<T>, seen: &mut HashSet<String>, items: Vec<T>, key: &K)
where
    K: Fn(&T) -> Option<String>,
{
    for item in items {
        let Some(k) = key(&item) else {
            continue;
        };
        if seen.insert(k) {
            out.push(item);
        }
    }
}
