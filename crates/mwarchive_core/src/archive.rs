use serde::Serialize;
use tracing::{debug, error, info};

use crate::error::{Result, RunAborted};
use crate::mediawiki::{PageRef, WikiReadApi};
use crate::store::{PersistOutcome, Persister};

#[derive(Debug, Clone, Serialize)]
pub struct PageFailure {
    pub page_id: i64,
    pub title: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NamespaceReport {
    pub namespace: i32,
    /// Pages selected for archiving, after the limit is applied.
    pub listed: usize,
    pub archived: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<PageFailure>,
    pub request_count: usize,
}

impl NamespaceReport {
    fn new(namespace: i32) -> Self {
        Self {
            namespace,
            listed: 0,
            archived: 0,
            skipped: 0,
            failed: 0,
            failures: Vec::new(),
            request_count: 0,
        }
    }
}

/// Drives enumeration, fetching and persistence for one wiki and one store.
pub struct Archiver<A, P> {
    api: A,
    store: P,
}

impl<A: WikiReadApi, P: Persister> Archiver<A, P> {
    pub fn new(api: A, store: P) -> Self {
        Self { api, store }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn store(&self) -> &P {
        &self.store
    }

    pub fn into_parts(self) -> (A, P) {
        (self.api, self.store)
    }

    /// Archive every configured namespace in order. An enumeration failure
    /// stops the run and hands back the reports of namespaces already finished.
    pub fn archive_all(
        &mut self,
        namespaces: &[i32],
        limit: i64,
    ) -> std::result::Result<Vec<NamespaceReport>, RunAborted> {
        let mut reports = Vec::with_capacity(namespaces.len());
        for &namespace in namespaces {
            match self.archive_namespace(namespace, limit) {
                Ok(report) => reports.push(report),
                Err(source) => {
                    return Err(RunAborted {
                        namespace,
                        completed: reports,
                        source,
                    });
                }
            }
        }
        Ok(reports)
    }

    /// Enumerate `namespace` and archive up to `limit` pages (`limit <= 0`: all).
    /// Only enumeration errors are returned; page-level errors land in the report.
    pub fn archive_namespace(&mut self, namespace: i32, limit: i64) -> Result<NamespaceReport> {
        info!(namespace, limit, "archiving namespace");
        let requests_before = self.api.request_count();
        let mut report = NamespaceReport::new(namespace);

        let mut pages = self.api.list_pages(namespace, limit)?;
        if let Ok(cap) = usize::try_from(limit)
            && cap > 0
        {
            pages.truncate(cap);
        }
        report.listed = pages.len();

        for page in &pages {
            match self.archive_page(namespace, page) {
                Ok(PageOutcome::Archived) => report.archived += 1,
                Ok(PageOutcome::Skipped) => report.skipped += 1,
                Err(err) => {
                    error!(
                        namespace,
                        page_id = page.page_id,
                        title = %page.title,
                        error = %err,
                        "failed to archive page"
                    );
                    report.failed += 1;
                    report.failures.push(PageFailure {
                        page_id: page.page_id,
                        title: page.title.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        report.request_count = self.api.request_count().saturating_sub(requests_before);
        info!(
            namespace,
            listed = report.listed,
            archived = report.archived,
            skipped = report.skipped,
            failed = report.failed,
            "finished namespace"
        );
        Ok(report)
    }

    fn archive_page(&mut self, namespace: i32, page: &PageRef) -> Result<PageOutcome> {
        // Write-once stores are checked before fetching so re-runs cost no requests.
        if self.store.is_archived(namespace, page)? {
            debug!(namespace, page_id = page.page_id, title = %page.title, "already archived");
            return Ok(PageOutcome::Skipped);
        }

        info!(namespace, page_id = page.page_id, title = %page.title, "archiving page");
        let content = self.api.fetch_latest_revision(&page.title)?;
        match self.store.persist(namespace, page, &content)? {
            PersistOutcome::Written => Ok(PageOutcome::Archived),
            PersistOutcome::AlreadyPresent => Ok(PageOutcome::Skipped),
        }
    }
}

enum PageOutcome {
    Archived,
    Skipped,
}
