pub mod book;
pub mod source;

pub use book::{Book, Chapter, Content, ContentBody, DiscoverCategory};
pub use source::{
    import_sources, BackendAction, BookFields, BookListParse, Categories, ChapterFields,
    ChapterModule, ChapterParse, ContentModule, ContentParse, DiscoverModule, DynamicCategoryRule,
    HttpMethod, ImportIssue, ImportReport, ModuleKind, NextUrlPagination, PageParam,
    PageParamPagination, PageStrategy, Pagination, RequestConfig, SearchModule, Source,
    SourceDocument, SourceType, StopCondition,
};
