//! Remote table access: the transport-independent contract and pagination.

use std::collections::VecDeque;

use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::model::ExternalId;

/// A remote row (or write payload) as a flat field name → value mapping.
pub type Fields = serde_json::Map<String, Value>;

/// One page of rows returned by the remote.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub rows: Vec<Fields>,
    pub is_last: bool,
}

/// Read/write access to the tables of a remote table service.
///
/// Implementations surface every transport, authentication or decoding failure
/// as [`SyncError::RemoteApi`](crate::SyncError::RemoteApi) and never retry.
pub trait RemoteApi {
    /// Fetches up to `limit` rows starting at `offset`, optionally restricted
    /// to a view of the table.
    fn fetch_page(&self, table: &str, view: Option<&str>, offset: usize, limit: usize)
    -> Result<Page>;

    /// Creates a row and returns the identifier the remote assigned to it.
    fn create_row(&self, table: &str, fields: &Fields) -> Result<ExternalId>;

    fn update_row(&self, table: &str, id: &ExternalId, fields: &Fields) -> Result<()>;

    /// Links the row to rows of another table through a link field.
    fn link_rows(
        &self,
        table: &str,
        link_field: &str,
        id: &ExternalId,
        targets: &[ExternalId],
    ) -> Result<()>;
}

/// Lazily pages through a table until the remote reports the last page.
pub fn fetch_rows<'a>(
    api: &'a dyn RemoteApi,
    table: &str,
    view: Option<&str>,
    page_size: usize,
) -> RowStream<'a> {
    RowStream {
        api,
        table: table.to_string(),
        view: view.map(str::to_string),
        page_size: page_size.max(1),
        offset: 0,
        buffer: VecDeque::new(),
        done: false,
    }
}

/// Iterator over the rows of one table or view. A fetch error is yielded once
/// and ends the stream.
pub struct RowStream<'a> {
    api: &'a dyn RemoteApi,
    table: String,
    view: Option<String>,
    page_size: usize,
    offset: usize,
    buffer: VecDeque<Fields>,
    done: bool,
}

impl RowStream<'_> {
    /// Starts over from the first page. Rows are fetched again.
    pub fn restart(&mut self) {
        self.offset = 0;
        self.buffer.clear();
        self.done = false;
    }

    fn fill(&mut self) -> Result<()> {
        let page = self.api.fetch_page(
            &self.table,
            self.view.as_deref(),
            self.offset,
            self.page_size,
        )?;
        debug!(
            table = %self.table,
            offset = self.offset,
            rows = page.rows.len(),
            last = page.is_last,
            "fetched page"
        );
        if page.rows.is_empty() && !page.is_last {
            return Err(SyncError::RemoteApi(format!(
                "{}: empty page at offset {} before end of table",
                self.table, self.offset
            )));
        }
        self.done = page.is_last;
        self.offset += page.rows.len();
        self.buffer.extend(page.rows);
        Ok(())
    }
}

impl Iterator for RowStream<'_> {
    type Item = Result<Fields>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.buffer.is_empty() {
            if self.done {
                return None;
            }
            if let Err(error) = self.fill() {
                self.done = true;
                return Some(Err(error));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
