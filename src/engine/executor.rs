//! Source Executor - the module-level orchestrators
//!
//! One entry point per module: `search`, `get_discover_categories` /
//! `get_discover_books`, `get_chapter_list`, `get_content`. Each follows
//! the same skeleton: parse and cache the module's rules, render the
//! request, drive the backend chosen by `request.action`, build records
//! page by page through the paginator, and persist `@put` flow variables
//! under each record's id. Foreign errors convert to `ReaderError` with
//! `{sourceId, module, url}` context at the operation boundary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::ast::RuleNode;
use super::debug::{DebugCollector, DebugScope, DebugStep, StepType};
use super::extract_script::{generate_extract_script, ExtractSpec, PurifyRule, PUT_FIELD_PREFIX};
use super::flow::FlowStore;
use super::http::{fetch_text, HttpClient, RenderedRequest, ReqwestClient, DEFAULT_TIMEOUT};
use super::js::JsRuntime;
use super::native::NativeEvaluator;
use super::paginate::{paginate_next_url, paginate_page_param, PageOutcome};
use super::parser::RuleCache;
use super::rate_limit::RateLimiter;
use super::template::{render_template, RuleContext};
use super::utils::resolve_absolute_url;
use super::value::RuleValue;
use super::webview::{webview_extract, WebViewProvider};
use crate::error::{ErrorContext, ReaderError, ReaderResult};
use crate::models::{
    BackendAction, Book, BookListParse, Categories, Chapter, Content, ContentBody, ContentModule,
    DiscoverCategory, ModuleKind, Pagination, RequestConfig, Source, SourceType,
};

const FIELD_SAMPLE_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, Default)]
pub struct OperationOptions {
    pub timeout_ms: Option<u64>,
}

/// The engine: collaborator capabilities plus the shared stores, built once
/// at startup and used by every operation.
pub struct Engine {
    http: Arc<dyn HttpClient>,
    webview: Option<Arc<dyn WebViewProvider>>,
    js: Option<Arc<dyn JsRuntime>>,
    debug: Option<Arc<dyn DebugCollector>>,
    limiter: RateLimiter,
    flow: FlowStore,
    rules: RuleCache,
}

#[derive(Default)]
pub struct EngineBuilder {
    http: Option<Arc<dyn HttpClient>>,
    webview: Option<Arc<dyn WebViewProvider>>,
    js: Option<Arc<dyn JsRuntime>>,
    debug: Option<Arc<dyn DebugCollector>>,
    flow_capacity: Option<usize>,
}

impl EngineBuilder {
    pub fn http(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http = Some(client);
        self
    }

    pub fn webview(mut self, provider: Arc<dyn WebViewProvider>) -> Self {
        self.webview = Some(provider);
        self
    }

    pub fn js_runtime(mut self, runtime: Arc<dyn JsRuntime>) -> Self {
        self.js = Some(runtime);
        self
    }

    pub fn debug_collector(mut self, collector: Arc<dyn DebugCollector>) -> Self {
        self.debug = Some(collector);
        self
    }

    pub fn flow_capacity(mut self, capacity: usize) -> Self {
        self.flow_capacity = Some(capacity);
        self
    }

    pub fn build(self) -> anyhow::Result<Engine> {
        let http = match self.http {
            Some(client) => client,
            None => Arc::new(ReqwestClient::new()?),
        };
        Ok(Engine {
            http,
            webview: self.webview,
            js: self.js,
            debug: self.debug,
            limiter: RateLimiter::new(),
            flow: self
                .flow_capacity
                .map(FlowStore::with_capacity)
                .unwrap_or_default(),
            rules: RuleCache::new(),
        })
    }
}

/// Everything one page load needs to render its request and evaluate rules.
struct PageInput<'a> {
    source: &'a Source,
    module: ModuleKind,
    request: &'a RequestConfig,
    /// Concrete URL from nextUrl pagination, overriding the url template
    url_override: Option<String>,
    keyword: Option<&'a str>,
    book: Option<&'a Book>,
    chapter: Option<&'a Chapter>,
    page: i64,
    page_index: i64,
    vars: &'a HashMap<String, String>,
    timeout: Duration,
    purify: &'a [PurifyRule],
}

/// Parsed rules of a list-producing module.
struct ListRules {
    list: Arc<RuleNode>,
    /// field key → rule, in output order
    fields: Vec<(String, Arc<RuleNode>)>,
    /// put name → rule, collected from every field selector's `@put`
    puts: Vec<(String, Arc<RuleNode>)>,
    next: Option<Arc<RuleNode>>,
}

/// One extracted list item before it becomes a domain record.
#[derive(Debug, Default)]
struct RawItem {
    fields: HashMap<String, String>,
    puts: HashMap<String, String>,
}

struct LoadedPage {
    url: String,
    items: Vec<RawItem>,
    next_url: Option<String>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    // === Upward API ===

    pub async fn search(
        &self,
        source: &Source,
        keyword: &str,
        opts: OperationOptions,
    ) -> ReaderResult<Vec<Book>> {
        let dbg = DebugScope::start(
            self.debug.as_deref(),
            &source.id,
            "search",
            serde_json::json!({ "keyword": keyword }),
        );
        tracing::info!(source_id = %source.id, keyword, "search");
        let result = self
            .with_deadline(opts, async {
                let module = source.search.as_ref().ok_or_else(|| {
                    ReaderError::source("source has no search module")
                })?;
                self.run_book_list(
                    source,
                    ModuleKind::Search,
                    &module.request,
                    &module.parse,
                    module.pagination.as_ref(),
                    Some(keyword),
                    None,
                    opts,
                    &dbg,
                )
                .await
            })
            .await;
        finish(result, &dbg, ErrorContext::new(&source.id, "search"))
    }

    pub async fn get_discover_categories(
        &self,
        source: &Source,
        opts: OperationOptions,
    ) -> ReaderResult<Vec<DiscoverCategory>> {
        let dbg = DebugScope::start(
            self.debug.as_deref(),
            &source.id,
            "discover",
            serde_json::json!({ "op": "categories" }),
        );
        let result = self
            .with_deadline(opts, async {
                let module = source.discover.as_ref().ok_or_else(|| {
                    ReaderError::source("source has no discover module")
                })?;
                if !module.enabled {
                    return Ok(vec![]);
                }
                match &module.categories {
                    Categories::Static(categories) => Ok(categories
                        .iter()
                        .map(|c| DiscoverCategory {
                            name: c.name.clone(),
                            url: resolve_absolute_url(&source.host, &c.url),
                        })
                        .collect()),
                    Categories::Dynamic(rule) => {
                        self.load_dynamic_categories(source, rule, opts, &dbg).await
                    }
                }
            })
            .await;
        finish(result, &dbg, ErrorContext::new(&source.id, "discover"))
    }

    pub async fn get_discover_books(
        &self,
        source: &Source,
        category: &DiscoverCategory,
        opts: OperationOptions,
    ) -> ReaderResult<Vec<Book>> {
        let dbg = DebugScope::start(
            self.debug.as_deref(),
            &source.id,
            "discover",
            serde_json::json!({ "category": category.name, "url": category.url }),
        );
        tracing::info!(source_id = %source.id, category = %category.name, "discover");
        let result = self
            .with_deadline(opts, async {
                let module = source.discover.as_ref().ok_or_else(|| {
                    ReaderError::source("source has no discover module")
                })?;
                let default_request = RequestConfig::load_current_url();
                let request = module.request.as_ref().unwrap_or(&default_request);
                self.run_book_list(
                    source,
                    ModuleKind::Discover,
                    request,
                    &module.parse,
                    module.pagination.as_ref(),
                    None,
                    Some(category.url.clone()),
                    opts,
                    &dbg,
                )
                .await
            })
            .await;
        finish(
            result,
            &dbg,
            ErrorContext::new(&source.id, "discover").with_url(category.url.clone()),
        )
    }

    pub async fn get_chapter_list(
        &self,
        source: &Source,
        book: &Book,
        opts: OperationOptions,
    ) -> ReaderResult<Vec<Chapter>> {
        let dbg = DebugScope::start(
            self.debug.as_deref(),
            &source.id,
            "chapter",
            serde_json::json!({ "book": book.name, "url": book.url }),
        );
        tracing::info!(source_id = %source.id, book = %book.name, "chapter list");
        let result = self
            .with_deadline(opts, async { self.chapter_list_inner(source, book, opts, &dbg).await })
            .await;
        finish(
            result,
            &dbg,
            ErrorContext::new(&source.id, "chapter").with_url(book.url.clone()),
        )
    }

    pub async fn get_content(
        &self,
        source: &Source,
        book: &Book,
        chapter: &Chapter,
        opts: OperationOptions,
    ) -> ReaderResult<Content> {
        let dbg = DebugScope::start(
            self.debug.as_deref(),
            &source.id,
            "content",
            serde_json::json!({ "chapter": chapter.name, "url": chapter.url }),
        );
        tracing::info!(source_id = %source.id, chapter = %chapter.name, "content");
        let result = self
            .with_deadline(opts, async {
                self.content_inner(source, book, chapter, opts, &dbg).await
            })
            .await;
        finish(
            result,
            &dbg,
            ErrorContext::new(&source.id, "content").with_url(chapter.url.clone()),
        )
    }

    // === Module internals ===

    #[allow(clippy::too_many_arguments)]
    async fn run_book_list(
        &self,
        source: &Source,
        module: ModuleKind,
        request: &RequestConfig,
        parse: &BookListParse,
        pagination: Option<&Pagination>,
        keyword: Option<&str>,
        base_url: Option<String>,
        opts: OperationOptions,
        dbg: &DebugScope,
    ) -> ReaderResult<Vec<Book>> {
        let rules = self.book_rules(parse, pagination)?;
        let seed_vars = source.vars.clone().unwrap_or_default();
        let timeout = request_timeout(request, opts);

        let seed_book = base_url.map(|url| placeholder_book(source, url));
        let input = |url_override: Option<String>, page: i64, page_index: i64| PageInput {
            source,
            module,
            request,
            url_override,
            keyword,
            book: seed_book.as_ref(),
            chapter: None,
            page,
            page_index,
            vars: &seed_vars,
            timeout,
            purify: &[],
        };

        let raw = self.paginate(pagination, &rules, &input, dbg).await?;

        let mut books = Vec::new();
        for (page_url, item) in raw {
            if let Some(book) = self.build_book(source, &page_url, item, &seed_vars) {
                books.push(book);
            }
        }
        dbg.step(DebugStep::new(
            StepType::Field,
            format!("{} produced {} books", module, books.len()),
        ));
        Ok(books)
    }

    async fn chapter_list_inner(
        &self,
        source: &Source,
        book: &Book,
        opts: OperationOptions,
        dbg: &DebugScope,
    ) -> ReaderResult<Vec<Chapter>> {
        let module = source.chapter.as_ref().ok_or_else(|| {
            ReaderError::source("source has no chapter module")
        })?;
        let default_request = RequestConfig::load_current_url();
        let request = module.request.as_ref().unwrap_or(&default_request);

        let rules = self.chapter_rules(module)?;
        let mut seed_vars = source.vars.clone().unwrap_or_default();
        seed_vars.extend(self.flow.snapshot(&source.id, &book.id));
        if let Some(vars) = &book.vars {
            seed_vars.extend(vars.clone());
        }
        let timeout = request_timeout(request, opts);

        let input = |url_override: Option<String>, page: i64, page_index: i64| PageInput {
            source,
            module: ModuleKind::Chapter,
            request,
            url_override,
            keyword: None,
            book: Some(book),
            chapter: None,
            page,
            page_index,
            vars: &seed_vars,
            timeout,
            purify: &[],
        };

        let raw = self
            .paginate(module.pagination.as_ref(), &rules, &input, dbg)
            .await?;

        let mut items: Vec<(String, RawItem)> = raw;
        if module.reverse {
            items.reverse();
        }

        let mut chapters = Vec::new();
        for (page_url, item) in items {
            let name = item.fields.get("name").cloned().unwrap_or_default();
            let url = item.fields.get("url").cloned().unwrap_or_default();
            if name.trim().is_empty() || url.trim().is_empty() {
                tracing::debug!(source_id = %source.id, "skipping chapter with empty name or url");
                continue;
            }
            let abs = resolve_absolute_url(&page_url, &url);

            let mut vars = seed_vars.clone();
            vars.extend(item.puts.clone());
            if !item.puts.is_empty() {
                self.flow.set_all(&source.id, &abs, item.puts);
            }
            self.flow.inherit(&source.id, &abs, &book.id);

            chapters.push(Chapter {
                id: abs.clone(),
                book_id: book.id.clone(),
                name: name.trim().to_string(),
                url: abs,
                index: chapters.len(),
                vars: if vars.is_empty() { None } else { Some(vars) },
            });
        }
        dbg.step(DebugStep::new(
            StepType::Field,
            format!("chapter list has {} entries", chapters.len()),
        ));
        Ok(chapters)
    }

    async fn content_inner(
        &self,
        source: &Source,
        book: &Book,
        chapter: &Chapter,
        opts: OperationOptions,
        dbg: &DebugScope,
    ) -> ReaderResult<Content> {
        let module = source.content.as_ref().ok_or_else(|| {
            ReaderError::source("source has no content module")
        })?;
        let default_request = RequestConfig::load_current_url();
        let request = module.request.as_ref().unwrap_or(&default_request);

        let content_rule = self
            .rules
            .field_rule(&module.parse.content)
            .map_err(|e| e.merge_context(field_ctx("parse.content")))?;
        let title_rule = match &module.parse.title {
            Some(expr) => Some(
                self.rules
                    .field_rule(expr)
                    .map_err(|e| e.merge_context(field_ctx("parse.title")))?,
            ),
            None => None,
        };
        let purify = parse_purify_rules(module)?;

        let mut seed_vars = source.vars.clone().unwrap_or_default();
        seed_vars.extend(self.flow.snapshot(&source.id, &chapter.id));
        if let Some(vars) = &chapter.vars {
            seed_vars.extend(vars.clone());
        }

        let input = PageInput {
            source,
            module: ModuleKind::Content,
            request,
            url_override: None,
            keyword: None,
            book: Some(book),
            chapter: Some(chapter),
            page: 1,
            page_index: 0,
            vars: &seed_vars,
            timeout: request_timeout(request, opts),
            purify: &purify,
        };

        let mut fields: Vec<(String, Arc<RuleNode>)> =
            vec![("content".to_string(), content_rule)];
        if let Some(title) = title_rule {
            fields.push(("title".to_string(), title));
        }

        let extracted = self.load_single(&input, &fields, dbg).await?;
        let body_text = extracted.get("content").cloned().unwrap_or_default();
        let title = extracted
            .get("title")
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        let body = match source.source_type {
            SourceType::Comic => ContentBody::Images(
                body_text
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(|l| resolve_absolute_url(&chapter.url, l))
                    .collect(),
            ),
            SourceType::Novel => ContentBody::Text(body_text.trim().to_string()),
        };
        if body.is_empty() {
            return Err(ReaderError::source("Empty content extracted"));
        }
        Ok(Content { title, body })
    }

    async fn load_dynamic_categories(
        &self,
        source: &Source,
        rule: &crate::models::DynamicCategoryRule,
        opts: OperationOptions,
        dbg: &DebugScope,
    ) -> ReaderResult<Vec<DiscoverCategory>> {
        let rules = ListRules {
            list: self
                .rules
                .list_rule(&rule.list)
                .map_err(|e| e.merge_context(field_ctx("categories.list")))?,
            fields: vec![
                (
                    "name".to_string(),
                    self.rules
                        .field_rule(&rule.name)
                        .map_err(|e| e.merge_context(field_ctx("categories.name")))?,
                ),
                (
                    "url".to_string(),
                    self.rules
                        .field_rule(&rule.url)
                        .map_err(|e| e.merge_context(field_ctx("categories.url")))?,
                ),
            ],
            puts: vec![],
            next: None,
        };
        let seed_vars = source.vars.clone().unwrap_or_default();
        let input = PageInput {
            source,
            module: ModuleKind::Discover,
            request: &rule.request,
            url_override: None,
            keyword: None,
            book: None,
            chapter: None,
            page: 1,
            page_index: 0,
            vars: &seed_vars,
            timeout: request_timeout(&rule.request, opts),
            purify: &[],
        };
        let page = self.load_page(&input, &rules, dbg).await?;
        Ok(page
            .items
            .into_iter()
            .filter_map(|item| {
                let name = item.fields.get("name")?.trim().to_string();
                let url = item.fields.get("url")?.trim().to_string();
                if name.is_empty() || url.is_empty() {
                    return None;
                }
                Some(DiscoverCategory {
                    name,
                    url: resolve_absolute_url(&page.url, &url),
                })
            })
            .collect())
    }

    // === Pagination plumbing ===

    /// Run the page loop, returning `(page_url, item)` pairs in output
    /// order. Dedup key is the item's absolute URL.
    async fn paginate<'a, F>(
        &self,
        pagination: Option<&Pagination>,
        rules: &ListRules,
        make_input: &F,
        dbg: &DebugScope,
    ) -> ReaderResult<Vec<(String, RawItem)>>
    where
        F: Fn(Option<String>, i64, i64) -> PageInput<'a>,
    {
        match pagination {
            None => {
                let input = make_input(None, 1, 0);
                let page = self.load_page(&input, rules, dbg).await?;
                let mut seen = std::collections::HashSet::new();
                Ok(page
                    .items
                    .into_iter()
                    .filter_map(|item| {
                        let key = item_key(&page.url, &item)?;
                        seen.insert(key).then(|| (page.url.clone(), item))
                    })
                    .collect())
            }
            Some(Pagination::NextUrl(cfg)) => {
                // pin down the rendered page-one URL so the visited set can
                // catch a next link looping back to it
                let initial_url = {
                    let input = make_input(None, 1, 0);
                    let ctx = self.make_context(&input);
                    self.render_request(&input, &ctx, dbg).await?.url
                };
                let stop = cfg.stop.clone().unwrap_or_default();
                paginate_next_url(
                    initial_url,
                    &stop,
                    |url, page, page_index| {
                        let input = make_input(Some(url), page, page_index);
                        async move {
                            let loaded = self.load_page(&input, rules, dbg).await?;
                            let page_url = loaded.url.clone();
                            Ok(PageOutcome {
                                items: loaded
                                    .items
                                    .into_iter()
                                    .map(|item| (page_url.clone(), item))
                                    .collect(),
                                next_url: loaded.next_url,
                            })
                        }
                    },
                    |(page_url, item)| item_key(page_url, item),
                )
                .await
            }
            Some(Pagination::PageParam(cfg)) => {
                paginate_page_param(
                    cfg,
                    |page_value, _page, page_index| {
                        let input = make_input(None, page_value, page_index);
                        async move {
                            let loaded = self.load_page(&input, rules, dbg).await?;
                            let page_url = loaded.url.clone();
                            Ok(loaded
                                .items
                                .into_iter()
                                .map(|item| (page_url.clone(), item))
                                .collect())
                        }
                    },
                    |(page_url, item): &(String, RawItem)| item_key(page_url, item),
                )
                .await
            }
        }
    }

    // === Backend dispatch ===

    /// Load one list page through whichever backend the request selects.
    async fn load_page(
        &self,
        input: &PageInput<'_>,
        rules: &ListRules,
        dbg: &DebugScope,
    ) -> ReaderResult<LoadedPage> {
        let ctx = self.make_context(input);
        let rendered = self.render_request(input, &ctx, dbg).await?;

        match input.request.action {
            BackendAction::Fetch => self.load_page_fetch(input, rules, rendered, dbg).await,
            BackendAction::LoadUrl => self.load_page_webview(input, rules, rendered, dbg).await,
        }
    }

    async fn load_page_fetch(
        &self,
        input: &PageInput<'_>,
        rules: &ListRules,
        rendered: RenderedRequest,
        dbg: &DebugScope,
    ) -> ReaderResult<LoadedPage> {
        let page = fetch_text(self.http.as_ref(), &self.limiter, input.source, &rendered, dbg)
            .await?;
        let mut body = page.text;
        for rule in input.purify {
            if let Some(rewritten) = rule.apply_native(&body)? {
                body = rewritten;
            }
        }

        let evaluator = NativeEvaluator::new(input.source, self.js.as_deref());
        let mut page_ctx = self.make_context(input);
        page_ctx.base_url = Some(page.url.clone());
        page_ctx.result = Some(RuleValue::Str(body));

        let item_strings = evaluator.eval_list(&rules.list, &page_ctx).await?;

        let mut items = Vec::with_capacity(item_strings.len());
        for (index, item_str) in item_strings.into_iter().enumerate() {
            let mut item_ctx = self.make_context(input);
            item_ctx.base_url = Some(page.url.clone());
            item_ctx.result = Some(RuleValue::Str(item_str));

            let mut item = RawItem::default();
            for (key, rule) in &rules.fields {
                let value = evaluator.eval_field(rule, &item_ctx).await.map_err(|e| {
                    e.merge_context(field_ctx(&format!("fields.{key}")))
                })?;
                item.fields.insert(key.clone(), value);
            }
            for (name, rule) in &rules.puts {
                let value = evaluator.eval_field(rule, &item_ctx).await.map_err(|e| {
                    e.merge_context(field_ctx(&format!("@put:{name}")))
                })?;
                item.puts.insert(name.clone(), value);
            }
            if index < FIELD_SAMPLE_LIMIT {
                sample_item(dbg, input, index, &item);
            }
            items.push(item);
        }

        let next_url = match &rules.next {
            Some(rule) => {
                let next = evaluator.eval_field(rule, &page_ctx).await.map_err(|e| {
                    e.merge_context(field_ctx("pagination.nextUrl"))
                })?;
                (!next.trim().is_empty()).then(|| resolve_absolute_url(&page.url, &next))
            }
            None => None,
        };

        Ok(LoadedPage {
            url: page.url,
            items,
            next_url,
        })
    }

    async fn load_page_webview(
        &self,
        input: &PageInput<'_>,
        rules: &ListRules,
        rendered: RenderedRequest,
        dbg: &DebugScope,
    ) -> ReaderResult<LoadedPage> {
        let provider = self.webview.as_deref().ok_or_else(|| {
            ReaderError::source("loadUrl request needs a webview provider, none configured")
        })?;

        let mut fields: Vec<(String, &RuleNode)> = rules
            .fields
            .iter()
            .map(|(key, rule)| (key.clone(), rule.as_ref()))
            .collect();
        for (name, rule) in &rules.puts {
            fields.push((format!("{PUT_FIELD_PREFIX}{name}"), rule.as_ref()));
        }
        let root_fields: Vec<(String, &RuleNode)> = rules
            .next
            .iter()
            .map(|rule| ("__next".to_string(), rule.as_ref()))
            .collect();

        let script = generate_extract_script(&ExtractSpec {
            list: Some(rules.list.as_ref()),
            fields,
            root_fields,
            purify: input.purify.to_vec(),
        });

        let value = webview_extract(
            provider,
            &self.limiter,
            input.source,
            &rendered.url,
            &script,
            input.timeout,
            dbg,
        )
        .await?;

        let (items_value, next_url) = match value {
            serde_json::Value::Array(arr) => (arr, None),
            serde_json::Value::Object(mut obj) => {
                let next = obj
                    .get("root")
                    .and_then(|r| r.get("__next"))
                    .and_then(|v| v.as_str())
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty());
                let items = match obj.remove("items") {
                    Some(serde_json::Value::Array(arr)) => arr,
                    _ => vec![],
                };
                (items, next)
            }
            other => {
                return Err(ReaderError::source(format!(
                    "unexpected extraction result shape: {other}"
                )))
            }
        };

        let items = items_value
            .into_iter()
            .enumerate()
            .map(|(index, value)| {
                let item = raw_item_from_json(value);
                if index < FIELD_SAMPLE_LIMIT {
                    sample_item(dbg, input, index, &item);
                }
                item
            })
            .collect();

        Ok(LoadedPage {
            url: rendered.url.clone(),
            items,
            next_url: next_url.map(|n| resolve_absolute_url(&rendered.url, &n)),
        })
    }

    /// Single-record extraction for the content module.
    async fn load_single(
        &self,
        input: &PageInput<'_>,
        fields: &[(String, Arc<RuleNode>)],
        dbg: &DebugScope,
    ) -> ReaderResult<HashMap<String, String>> {
        let ctx = self.make_context(input);
        let rendered = self.render_request(input, &ctx, dbg).await?;

        match input.request.action {
            BackendAction::Fetch => {
                let page =
                    fetch_text(self.http.as_ref(), &self.limiter, input.source, &rendered, dbg)
                        .await?;
                let mut body = page.text;
                // fetch mode purifies the raw body before extraction
                for rule in input.purify {
                    if let Some(rewritten) = rule.apply_native(&body)? {
                        body = rewritten;
                    }
                }
                let evaluator = NativeEvaluator::new(input.source, self.js.as_deref());
                let mut page_ctx = self.make_context(input);
                page_ctx.base_url = Some(page.url.clone());
                page_ctx.result = Some(RuleValue::Str(body));

                let mut out = HashMap::new();
                for (key, rule) in fields {
                    let value = evaluator.eval_field(rule, &page_ctx).await.map_err(|e| {
                        e.merge_context(field_ctx(&format!("parse.{key}")))
                    })?;
                    out.insert(key.clone(), value);
                }
                Ok(out)
            }
            BackendAction::LoadUrl => {
                let provider = self.webview.as_deref().ok_or_else(|| {
                    ReaderError::source("loadUrl request needs a webview provider, none configured")
                })?;
                let script = generate_extract_script(&ExtractSpec {
                    list: None,
                    fields: fields
                        .iter()
                        .map(|(key, rule)| (key.clone(), rule.as_ref()))
                        .collect(),
                    root_fields: vec![],
                    purify: input.purify.to_vec(),
                });
                let value = webview_extract(
                    provider,
                    &self.limiter,
                    input.source,
                    &rendered.url,
                    &script,
                    input.timeout,
                    dbg,
                )
                .await?;
                let item = raw_item_from_json(value);
                Ok(item.fields)
            }
        }
    }

    // === Request rendering ===

    fn make_context<'c>(&self, input: &'c PageInput<'c>) -> RuleContext<'c> {
        let mut ctx = RuleContext::new(input.source);
        ctx.book = input.book;
        ctx.chapter = input.chapter;
        ctx.keyword = input.keyword.map(str::to_string);
        ctx.page = Some(input.page);
        ctx.page_index = Some(input.page_index);
        ctx.vars = input.vars.clone();
        ctx
    }

    async fn render_request(
        &self,
        input: &PageInput<'_>,
        ctx: &RuleContext<'_>,
        dbg: &DebugScope,
    ) -> ReaderResult<RenderedRequest> {
        let js = self.js.as_deref();
        let url = match &input.url_override {
            Some(concrete) => concrete.clone(),
            None => {
                let rendered = render_template(&input.request.url, ctx, js, Some(dbg))
                    .await
                    .map_err(|e| ReaderError::parse(e, &input.request.url))?;
                resolve_absolute_url(&input.source.host, rendered.trim())
            }
        };

        let mut headers = input.source.headers.clone().unwrap_or_default();
        if let Some(extra) = &input.request.headers {
            headers.extend(extra.clone());
        }
        let mut rendered_headers = HashMap::with_capacity(headers.len());
        for (key, value) in headers {
            let value = render_template(&value, ctx, js, Some(dbg))
                .await
                .map_err(|e| ReaderError::parse(e, &value))?;
            rendered_headers.insert(key, value);
        }

        let body = match &input.request.body {
            Some(body) => Some(
                render_template(body, ctx, js, Some(dbg))
                    .await
                    .map_err(|e| ReaderError::parse(e, body))?,
            ),
            None => None,
        };

        Ok(RenderedRequest {
            url,
            method: input.request.method,
            headers: rendered_headers,
            body,
            timeout: input.timeout,
            charset: input
                .request
                .charset
                .clone()
                .or_else(|| input.source.charset.clone()),
        })
    }

    // === Rule preparation ===

    fn book_rules(
        &self,
        parse: &BookListParse,
        pagination: Option<&Pagination>,
    ) -> ReaderResult<ListRules> {
        let list = self
            .rules
            .list_rule(&parse.list)
            .map_err(|e| e.merge_context(field_ctx("parse.list")))?;

        let mut fields = Vec::new();
        let mut add = |key: &str, expr: Option<&String>| -> ReaderResult<()> {
            if let Some(expr) = expr {
                let rule = self
                    .rules
                    .field_rule(expr)
                    .map_err(|e| e.merge_context(field_ctx(&format!("fields.{key}"))))?;
                fields.push((key.to_string(), rule));
            }
            Ok(())
        };
        add("name", Some(&parse.fields.name))?;
        add("url", Some(&parse.fields.url))?;
        add("author", parse.fields.author.as_ref())?;
        add("cover", parse.fields.cover.as_ref())?;
        add("intro", parse.fields.intro.as_ref())?;
        add("latestChapter", parse.fields.latest_chapter.as_ref())?;

        self.assemble_rules(list, fields, pagination)
    }

    fn chapter_rules(&self, module: &crate::models::ChapterModule) -> ReaderResult<ListRules> {
        let list = self
            .rules
            .list_rule(&module.parse.list)
            .map_err(|e| e.merge_context(field_ctx("parse.list")))?;
        let fields = vec![
            (
                "name".to_string(),
                self.rules
                    .field_rule(&module.parse.fields.name)
                    .map_err(|e| e.merge_context(field_ctx("fields.name")))?,
            ),
            (
                "url".to_string(),
                self.rules
                    .field_rule(&module.parse.fields.url)
                    .map_err(|e| e.merge_context(field_ctx("fields.url")))?,
            ),
        ];
        self.assemble_rules(list, fields, module.pagination.as_ref())
    }

    fn assemble_rules(
        &self,
        list: Arc<RuleNode>,
        fields: Vec<(String, Arc<RuleNode>)>,
        pagination: Option<&Pagination>,
    ) -> ReaderResult<ListRules> {
        let mut puts = Vec::new();
        for (key, rule) in &fields {
            if let Some(selector) = rule.as_selector() {
                for (name, put_expr) in &selector.put_vars {
                    let put_rule = self.rules.field_rule(put_expr).map_err(|e| {
                        e.merge_context(field_ctx(&format!("fields.{key}@put:{name}")))
                    })?;
                    puts.push((name.clone(), put_rule));
                }
            }
        }

        let next = match pagination {
            Some(Pagination::NextUrl(cfg)) => Some(
                self.rules
                    .field_rule(&cfg.next_url)
                    .map_err(|e| e.merge_context(field_ctx("pagination.nextUrl")))?,
            ),
            _ => None,
        };

        Ok(ListRules {
            list,
            fields,
            puts,
            next,
        })
    }

    // === Record building ===

    fn build_book(
        &self,
        source: &Source,
        page_url: &str,
        item: RawItem,
        seed_vars: &HashMap<String, String>,
    ) -> Option<Book> {
        let name = item.fields.get("name").cloned().unwrap_or_default();
        let url = item.fields.get("url").cloned().unwrap_or_default();
        if name.trim().is_empty() || url.trim().is_empty() {
            tracing::debug!(source_id = %source.id, "skipping book with empty name or url");
            return None;
        }
        let abs = resolve_absolute_url(page_url, &url);

        let mut vars = seed_vars.clone();
        vars.extend(item.puts.clone());
        if !item.puts.is_empty() {
            self.flow.set_all(&source.id, &abs, item.puts);
        }

        let field = |key: &str| {
            item.fields
                .get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Some(Book {
            id: abs.clone(),
            source_id: source.id.clone(),
            name: name.trim().to_string(),
            url: abs,
            author: field("author"),
            cover: field("cover").map(|c| resolve_absolute_url(page_url, &c)),
            intro: field("intro"),
            latest_chapter: field("latestChapter"),
            vars: if vars.is_empty() { None } else { Some(vars) },
        })
    }

    async fn with_deadline<T>(
        &self,
        opts: OperationOptions,
        fut: impl std::future::Future<Output = ReaderResult<T>>,
    ) -> ReaderResult<T> {
        match opts.timeout_ms {
            None => fut.await,
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), fut)
                .await
                .unwrap_or_else(|_| {
                    Err(ReaderError::network(
                        format!("operation timed out after {ms}ms"),
                        None,
                    ))
                }),
        }
    }
}

fn request_timeout(request: &RequestConfig, opts: OperationOptions) -> Duration {
    request
        .timeout
        .or(opts.timeout_ms)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_TIMEOUT)
}

fn field_ctx(path: &str) -> ErrorContext {
    ErrorContext::default().with_field_path(path.to_string())
}

/// Module-level purify rules run before `parse.purify` ones.
fn parse_purify_rules(module: &ContentModule) -> ReaderResult<Vec<PurifyRule>> {
    let mut rules = Vec::new();
    for (path, list) in [
        ("purify", module.purify.as_ref()),
        ("parse.purify", module.parse.purify.as_ref()),
    ] {
        for raw in list.into_iter().flatten() {
            rules.push(
                PurifyRule::parse(raw).map_err(|e| e.merge_context(field_ctx(path)))?,
            );
        }
    }
    Ok(rules)
}

fn finish<T>(result: ReaderResult<T>, dbg: &DebugScope, ctx: ErrorContext) -> ReaderResult<T> {
    match result {
        Ok(value) => {
            dbg.end_ok();
            Ok(value)
        }
        Err(e) => {
            let e = e.merge_context(ctx);
            dbg.end_error(&e);
            tracing::warn!(error = %e, "operation failed");
            Err(e)
        }
    }
}

fn item_key(page_url: &str, item: &RawItem) -> Option<String> {
    let url = item.fields.get("url")?;
    if url.trim().is_empty() {
        return None;
    }
    Some(resolve_absolute_url(page_url, url))
}

fn raw_item_from_json(value: serde_json::Value) -> RawItem {
    let mut item = RawItem::default();
    if let serde_json::Value::Object(map) = value {
        for (key, value) in map {
            let text = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            match key.strip_prefix(PUT_FIELD_PREFIX) {
                Some(put_name) => {
                    item.puts.insert(put_name.to_string(), text);
                }
                None => {
                    item.fields.insert(key, text);
                }
            }
        }
    }
    item
}

fn sample_item(dbg: &DebugScope, input: &PageInput<'_>, index: usize, item: &RawItem) {
    if !dbg.enabled() {
        return;
    }
    dbg.step(
        DebugStep::new(
            StepType::Field,
            format!("{} item {} on page {}", input.module, index, input.page),
        )
        .data(serde_json::json!({
            "fields": item.fields,
            "puts": item.puts,
        })),
    );
}

fn placeholder_book(source: &Source, url: String) -> Book {
    Book {
        id: url.clone(),
        source_id: source.id.clone(),
        name: String::new(),
        url,
        author: None,
        cover: None,
        intro: None,
        latest_chapter: None,
        vars: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::debug::testing::MemoryCollector;
    use crate::engine::http::testing::MockHttpClient;
    use crate::engine::js::testing::ScriptedJsRuntime;
    use crate::engine::webview::testing::{probe, FakePage, FakeWebViewProvider};

    fn source_from(value: serde_json::Value) -> Source {
        serde_json::from_value(value).unwrap()
    }

    struct TestEngine {
        http: Arc<MockHttpClient>,
        webview: Arc<FakeWebViewProvider>,
        collector: MemoryCollector,
        engine: Engine,
    }

    fn engine_with(
        http: MockHttpClient,
        webview: FakeWebViewProvider,
        js: Option<ScriptedJsRuntime>,
    ) -> TestEngine {
        let http = Arc::new(http);
        let webview = Arc::new(webview);
        let collector = MemoryCollector::new();
        let mut builder = Engine::builder()
            .http(http.clone())
            .webview(webview.clone())
            .debug_collector(Arc::new(collector.clone()));
        if let Some(js) = js {
            builder = builder.js_runtime(Arc::new(js));
        }
        TestEngine {
            http,
            webview,
            collector,
            engine: builder.build().unwrap(),
        }
    }

    fn opts() -> OperationOptions {
        OperationOptions::default()
    }

    #[tokio::test]
    async fn test_search_webview_html() {
        let webview = FakeWebViewProvider::new().page(
            "https://x/?q=k",
            FakePage::clear(serde_json::json!([
                {"name": "A", "url": "/b/1"},
                {"name": "B", "url": "/b/2"}
            ])),
        );
        let t = engine_with(MockHttpClient::new(), webview, None);
        let source = source_from(serde_json::json!({
            "id": "s1", "name": "X", "host": "https://x",
            "search": {
                "request": {"url": "https://x/?q={{keyword}}", "action": "loadUrl"},
                "parse": {"list": ".r li", "fields": {"name": ".t@text", "url": "a@href"}}
            }
        }));

        let books = t.engine.search(&source, "k", opts()).await.unwrap();
        assert_eq!(books.len(), 2);
        assert_eq!(books[0].id, "https://x/b/1");
        assert_eq!(books[0].name, "A");
        assert_eq!(books[0].url, "https://x/b/1");
        assert_eq!(books[1].id, "https://x/b/2");
        assert_eq!(books[1].name, "B");
        assert!(t.collector.recorded.lock().unwrap().ended_ok);
    }

    #[tokio::test]
    async fn test_search_fetch_json() {
        let http = MockHttpClient::new().respond(
            "https://api/s?q=k",
            r#"{"data":{"list":[{"id":7,"title":"Foo"}]}}"#,
        );
        let js = ScriptedJsRuntime::new()
            .respond(
                "JSON.parse(result).data.list",
                RuleValue::Raw(serde_json::json!([{"id": 7, "title": "Foo"}])),
            )
            .respond("result.title", RuleValue::Str("Foo".into()))
            .respond(
                "host+'/book/'+result.id",
                RuleValue::Str("https://api/book/7".into()),
            );
        let t = engine_with(http, FakeWebViewProvider::new(), Some(js));
        let source = source_from(serde_json::json!({
            "id": "s1", "name": "Api", "host": "https://api",
            "search": {
                "request": {"url": "https://api/s?q={{keyword}}", "action": "fetch"},
                "parse": {
                    "list": "@js:JSON.parse(result).data.list",
                    "fields": {
                        "name": "@js:result.title",
                        "url": "@js:host+'/book/'+result.id"
                    }
                }
            }
        }));

        let books = t.engine.search(&source, "k", opts()).await.unwrap();
        assert_eq!(books.len(), 1);
        assert_eq!(books[0].name, "Foo");
        assert_eq!(books[0].url, "https://api/book/7");
        assert_eq!(books[0].source_id, "s1");
    }

    #[tokio::test]
    async fn test_composite_fallback_in_fields() {
        let http = MockHttpClient::new().respond(
            "https://api/s?q=k",
            r#"{"list":[{"title":"Foo","link":"/b/1"}]}"#,
        );
        let t = engine_with(http, FakeWebViewProvider::new(), None);
        let source = source_from(serde_json::json!({
            "id": "s1", "name": "Api", "host": "https://api",
            "search": {
                "request": {"url": "https://api/s?q={{keyword}}", "action": "fetch"},
                "parse": {
                    "list": "$.list",
                    "fields": {"name": "$.bad || $.title", "url": "$.link"}
                }
            }
        }));

        let books = t.engine.search(&source, "k", opts()).await.unwrap();
        assert_eq!(books.len(), 1);
        assert_eq!(books[0].name, "Foo");
        assert_eq!(books[0].url, "https://api/b/1");
    }

    #[tokio::test]
    async fn test_chapter_pagination_next_url() {
        let webview = FakeWebViewProvider::new()
            .page(
                "https://x/toc",
                FakePage::clear(serde_json::json!({
                    "root": {"__next": "/toc2"},
                    "items": [
                        {"name": "c1", "url": "/c/1"},
                        {"name": "c2", "url": "/c/2"}
                    ]
                })),
            )
            .page(
                "https://x/toc2",
                FakePage::clear(serde_json::json!({
                    "root": {"__next": "/toc3"},
                    "items": [
                        {"name": "c3", "url": "/c/3"},
                        {"name": "c4", "url": "/c/4"}
                    ]
                })),
            )
            .page(
                "https://x/toc3",
                FakePage::clear(serde_json::json!({
                    "root": {"__next": ""},
                    "items": [
                        {"name": "c5", "url": "/c/5"},
                        {"name": "c6", "url": "/c/6"}
                    ]
                })),
            );
        let t = engine_with(MockHttpClient::new(), webview, None);
        let source = source_from(serde_json::json!({
            "id": "s1", "name": "X", "host": "https://x",
            "chapter": {
                "parse": {"list": "ul.c li", "fields": {"name": "a@text", "url": "a@href"}},
                "pagination": {"nextUrl": "a.next@href", "stop": {"maxPages": 3}}
            }
        }));
        let book = placeholder_book(&source, "https://x/toc".to_string());

        let chapters = t.engine.get_chapter_list(&source, &book, opts()).await.unwrap();
        assert_eq!(chapters.len(), 6);
        for (i, chapter) in chapters.iter().enumerate() {
            assert_eq!(chapter.index, i);
            assert_eq!(chapter.name, format!("c{}", i + 1));
            assert_eq!(chapter.url, format!("https://x/c/{}", i + 1));
            assert_eq!(chapter.book_id, "https://x/toc");
        }
    }

    #[tokio::test]
    async fn test_chapter_reverse_assigns_indices_after() {
        let http = MockHttpClient::new().respond(
            "https://x/toc",
            r#"{"chapters":[{"n":"B","u":"/2"},{"n":"A","u":"/1"}]}"#,
        );
        let t = engine_with(http, FakeWebViewProvider::new(), None);
        let source = source_from(serde_json::json!({
            "id": "s1", "name": "X", "host": "https://x",
            "chapter": {
                "request": {"url": "https://x/toc", "action": "fetch"},
                "parse": {"list": "$.chapters", "fields": {"name": "$.n", "url": "$.u"}},
                "reverse": true
            }
        }));
        let book = placeholder_book(&source, "https://x/book".to_string());

        let chapters = t.engine.get_chapter_list(&source, &book, opts()).await.unwrap();
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].name, "A");
        assert_eq!(chapters[0].index, 0);
        assert_eq!(chapters[1].name, "B");
        assert_eq!(chapters[1].index, 1);
    }

    #[tokio::test]
    async fn test_comic_content_splits_lines() {
        let webview = FakeWebViewProvider::new().page(
            "https://x/ch/1",
            FakePage::clear(serde_json::json!({
                "content": "https://img/1.jpg\nhttps://img/2.jpg\nhttps://img/3.jpg"
            })),
        );
        let t = engine_with(MockHttpClient::new(), webview, None);
        let source = source_from(serde_json::json!({
            "id": "s1", "name": "X", "host": "https://x", "type": "comic",
            "content": {
                "parse": {"content": "img.page@src"}
            }
        }));
        let book = placeholder_book(&source, "https://x/book".to_string());
        let chapter = Chapter {
            id: "https://x/ch/1".into(),
            book_id: book.id.clone(),
            name: "ch1".into(),
            url: "https://x/ch/1".into(),
            index: 0,
            vars: None,
        };

        let content = t
            .engine
            .get_content(&source, &book, &chapter, opts())
            .await
            .unwrap();
        assert_eq!(
            content.body,
            ContentBody::Images(vec![
                "https://img/1.jpg".into(),
                "https://img/2.jpg".into(),
                "https://img/3.jpg".into()
            ])
        );
    }

    #[tokio::test]
    async fn test_turnstile_stops_operation() {
        let webview = FakeWebViewProvider::new().page(
            "https://x/?q=k",
            FakePage {
                cf_probes: vec![probe(true, true)],
                extraction: serde_json::Value::Null,
                fail_load: false,
            },
        );
        let t = engine_with(MockHttpClient::new(), webview, None);
        let source = source_from(serde_json::json!({
            "id": "s1", "name": "X", "host": "https://x",
            "search": {
                "request": {"url": "https://x/?q={{keyword}}", "action": "loadUrl"},
                "parse": {"list": ".r li", "fields": {"name": ".t@text", "url": "a@href"}}
            }
        }));

        let err = t.engine.search(&source, "k", opts()).await.unwrap_err();
        assert_eq!(err.kind(), "source");
        assert!(err.to_string().contains("Turnstile"));
        // one controller was created, nothing else went out
        assert_eq!(*t.webview.created.lock().unwrap(), 1);
        assert!(t.http.requests.lock().unwrap().is_empty());
        assert!(t.collector.recorded.lock().unwrap().error.is_some());
    }

    #[tokio::test]
    async fn test_put_vars_flow_to_chapters() {
        let http = MockHttpClient::new()
            .respond(
                "https://x/s?q=k",
                r#"{"list":[{"title":"Foo","link":"/b/1","token":"t0k"}]}"#,
            )
            .respond(
                "https://x/toc?t=t0k",
                r#"{"chapters":[{"n":"C1","u":"/c/1"}]}"#,
            );
        let t = engine_with(http, FakeWebViewProvider::new(), None);
        let source = source_from(serde_json::json!({
            "id": "s1", "name": "X", "host": "https://x",
            "search": {
                "request": {"url": "https://x/s?q={{keyword}}", "action": "fetch"},
                "parse": {
                    "list": "$.list",
                    "fields": {
                        "name": "$.title",
                        "url": "$.link @put:{token:$.token}"
                    }
                }
            },
            "chapter": {
                "request": {"url": "https://x/toc?t={{@get:token}}", "action": "fetch"},
                "parse": {"list": "$.chapters", "fields": {"name": "$.n", "url": "$.u"}}
            }
        }));

        let books = t.engine.search(&source, "k", opts()).await.unwrap();
        assert_eq!(books.len(), 1);
        let book = &books[0];
        assert_eq!(
            book.vars.as_ref().unwrap().get("token").map(String::as_str),
            Some("t0k")
        );

        let chapters = t.engine.get_chapter_list(&source, book, opts()).await.unwrap();
        assert_eq!(chapters.len(), 1);
        // the chapter request rendered the book's flow variable
        assert!(t
            .http
            .requests
            .lock()
            .unwrap()
            .contains(&"https://x/toc?t=t0k".to_string()));
        // and the chapter scope inherited it
        assert_eq!(
            chapters[0].vars.as_ref().unwrap().get("token").map(String::as_str),
            Some("t0k")
        );
    }

    #[tokio::test]
    async fn test_content_purify_runs_before_extraction() {
        let http = MockHttpClient::new().respond(
            "https://x/ch",
            "<html><p>helloADworld</p></html>",
        );
        let t = engine_with(http, FakeWebViewProvider::new(), None);
        let source = source_from(serde_json::json!({
            "id": "s1", "name": "X", "host": "https://x",
            "content": {
                "request": {"url": "{{url}}", "action": "fetch"},
                "purify": ["##AD##"],
                "parse": {"content": "@regex:<p>(.*?)</p>"}
            }
        }));
        let book = placeholder_book(&source, "https://x/book".to_string());
        let chapter = Chapter {
            id: "https://x/ch".into(),
            book_id: book.id.clone(),
            name: "ch".into(),
            url: "https://x/ch".into(),
            index: 0,
            vars: None,
        };

        let content = t
            .engine
            .get_content(&source, &book, &chapter, opts())
            .await
            .unwrap();
        assert_eq!(content.body, ContentBody::Text("helloworld".into()));
    }

    #[tokio::test]
    async fn test_empty_content_is_source_error() {
        let http = MockHttpClient::new().respond("https://x/ch", r#"{"body":""}"#);
        let t = engine_with(http, FakeWebViewProvider::new(), None);
        let source = source_from(serde_json::json!({
            "id": "s1", "name": "X", "host": "https://x",
            "content": {
                "request": {"url": "{{url}}", "action": "fetch"},
                "parse": {"content": "$.body"}
            }
        }));
        let book = placeholder_book(&source, "https://x/book".to_string());
        let chapter = Chapter {
            id: "https://x/ch".into(),
            book_id: book.id.clone(),
            name: "ch".into(),
            url: "https://x/ch".into(),
            index: 0,
            vars: None,
        };

        let err = t
            .engine
            .get_content(&source, &book, &chapter, opts())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Empty content extracted"));
        let ctx = err.context();
        assert_eq!(ctx.source_id.as_deref(), Some("s1"));
        assert_eq!(ctx.module.as_deref(), Some("content"));
    }

    #[tokio::test]
    async fn test_discover_static_categories() {
        let t = engine_with(MockHttpClient::new(), FakeWebViewProvider::new(), None);
        let source = source_from(serde_json::json!({
            "id": "s1", "name": "X", "host": "https://x",
            "discover": {
                "categories": [
                    {"name": "Fantasy", "url": "/cat/fantasy"},
                    {"name": "Sci-Fi", "url": "https://x/cat/scifi"}
                ],
                "parse": {"list": ".b", "fields": {"name": ".t@text", "url": "a@href"}}
            }
        }));

        let categories = t
            .engine
            .get_discover_categories(&source, opts())
            .await
            .unwrap();
        assert_eq!(categories.len(), 2);
        assert_eq!(categories[0].url, "https://x/cat/fantasy");
        assert_eq!(categories[1].url, "https://x/cat/scifi");
    }

    #[tokio::test]
    async fn test_discover_books_uses_category_url() {
        let http = MockHttpClient::new().respond(
            "https://x/cat/fantasy?p=1",
            r#"{"list":[{"t":"Foo","u":"/b/1"}]}"#,
        );
        let t = engine_with(http, FakeWebViewProvider::new(), None);
        let source = source_from(serde_json::json!({
            "id": "s1", "name": "X", "host": "https://x",
            "discover": {
                "request": {"url": "{{url}}?p={{page}}", "action": "fetch"},
                "categories": [{"name": "Fantasy", "url": "https://x/cat/fantasy"}],
                "parse": {"list": "$.list", "fields": {"name": "$.t", "url": "$.u"}}
            }
        }));
        let category = DiscoverCategory {
            name: "Fantasy".into(),
            url: "https://x/cat/fantasy".into(),
        };

        let books = t
            .engine
            .get_discover_books(&source, &category, opts())
            .await
            .unwrap();
        assert_eq!(books.len(), 1);
        assert_eq!(books[0].url, "https://x/b/1");
    }

    #[tokio::test]
    async fn test_parse_error_carries_context() {
        let t = engine_with(MockHttpClient::new(), FakeWebViewProvider::new(), None);
        let source = source_from(serde_json::json!({
            "id": "s1", "name": "X", "host": "https://x",
            "search": {
                "request": {"url": "https://x/?q={{keyword}}", "action": "fetch"},
                "parse": {
                    "list": "$.list",
                    "fields": {"name": "$.a || $.b && $.c", "url": "$.u"}
                }
            }
        }));

        let err = t.engine.search(&source, "k", opts()).await.unwrap_err();
        match &err {
            ReaderError::Parse { context, expr, .. } => {
                assert_eq!(context.source_id.as_deref(), Some("s1"));
                assert_eq!(context.module.as_deref(), Some("search"));
                assert_eq!(context.field_path.as_deref(), Some("fields.name"));
                assert!(expr.contains("||"));
            }
            other => panic!("expected parse error, got {other}"),
        }
        // nothing was fetched: parse errors surface before any request
        assert!(t.http.requests.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_deadline() {
        struct NeverClient;

        #[async_trait::async_trait]
        impl HttpClient for NeverClient {
            async fn fetch(
                &self,
                _url: &str,
                _request: &RenderedRequest,
            ) -> anyhow::Result<crate::engine::http::HttpResponse> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!("the deadline fires first");
            }
        }

        let engine = Engine::builder().http(Arc::new(NeverClient)).build().unwrap();
        let source = source_from(serde_json::json!({
            "id": "s1", "name": "X", "host": "https://x",
            "search": {
                "request": {"url": "https://x/?q={{keyword}}", "action": "fetch"},
                "parse": {"list": "$.list", "fields": {"name": "$.t", "url": "$.u"}}
            }
        }));

        let err = engine
            .search(
                &source,
                "k",
                OperationOptions {
                    timeout_ms: Some(250),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "network");
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_debug_steps_for_fetch_search() {
        let http = MockHttpClient::new().respond(
            "https://x/s?q=k",
            r#"{"list":[{"t":"Foo","u":"/b/1"}]}"#,
        );
        let t = engine_with(http, FakeWebViewProvider::new(), None);
        let source = source_from(serde_json::json!({
            "id": "s1", "name": "X", "host": "https://x",
            "search": {
                "request": {"url": "https://x/s?q={{keyword}}", "action": "fetch"},
                "parse": {"list": "$.list", "fields": {"name": "$.t", "url": "$.u"}}
            }
        }));

        t.engine.search(&source, "k", opts()).await.unwrap();
        let types = t.collector.step_types();
        assert!(types.contains(&StepType::Request));
        assert!(types.contains(&StepType::Response));
        assert!(types.contains(&StepType::Field));
        assert!(t.collector.recorded.lock().unwrap().ended_ok);
    }
}
