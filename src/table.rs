//! Append-only paged tables and the cursors the engine reads them through.
//!
//! A [`Table`] is a list of [`TuplePage`]s sharing one schema. It is filled
//! single-threaded (loading, serial probe) or through a [`TableAppender`]
//! when several probe workers emit into the same output. Once filled, a
//! table is frozen behind an `Arc` and scanned through [`TableCursor`]s.

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::Result;
use crate::loader::Loader;
use crate::page::{TuplePage, reserve_slot};
use crate::schema::SchemaRef;

/// Location of a tuple inside a [`Table`]: page number and slot within it.
///
/// Stored in POINTER columns as `page << 32 | slot`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TupleRef {
    pub page: u32,
    pub slot: u32,
}

impl TupleRef {
    #[inline(always)]
    pub fn new(page: usize, slot: usize) -> Self {
        debug_assert!(page <= u32::MAX as usize && slot <= u32::MAX as usize);
        Self {
            page: page as u32,
            slot: slot as u32,
        }
    }

    #[inline(always)]
    pub fn pack(self) -> u64 {
        (self.page as u64) << 32 | self.slot as u64
    }

    #[inline(always)]
    pub fn unpack(packed: u64) -> Self {
        Self {
            page: (packed >> 32) as u32,
            slot: packed as u32,
        }
    }
}

impl std::fmt::Display for TupleRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}:{}", self.page, self.slot)
    }
}

pub struct Table {
    schema: SchemaRef,
    page_size: usize,
    pages: Vec<TuplePage>,
}

impl Table {
    /// Creates an empty table whose pages hold `page_size` bytes each.
    pub fn new(schema: SchemaRef, page_size: usize) -> Self {
        assert!(
            schema.tuple_size() <= page_size,
            "{}-byte tuples do not fit {page_size}-byte pages",
            schema.tuple_size()
        );
        Self {
            schema,
            page_size,
            pages: Vec::new(),
        }
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn pages(&self) -> &[TuplePage] {
        &self.pages
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Number of tuples.
    pub fn len(&self) -> usize {
        self.pages.iter().map(TuplePage::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.iter().all(TuplePage::is_empty)
    }

    /// Copies one encoded tuple to the end of the table.
    pub fn append(&mut self, src: &[u8]) {
        let (page, offset) = reserve_slot(&mut self.pages, self.page_size, self.schema.tuple_size());
        self.schema.copy_tuple(self.pages[page].slot_mut(offset), src);
    }

    /// Parses one text field per column and appends the result.
    pub fn append_fields<S: AsRef<str>>(&mut self, fields: &[S]) -> Result<()> {
        let mut tuple = vec![0u8; self.schema.tuple_size()];
        self.schema.parse_tuple(&mut tuple, fields)?;
        self.append(&tuple);
        Ok(())
    }

    /// Loads a delimited text file (optionally bzip2-compressed), returning
    /// the number of tuples appended.
    pub fn load(&mut self, path: impl AsRef<Path>, separator: char) -> Result<usize> {
        Loader::new(separator).load(path.as_ref(), self)
    }

    pub fn tuple(&self, r: TupleRef) -> Option<&[u8]> {
        self.pages.get(r.page as usize)?.tuple(r.slot as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.pages.iter().flat_map(TuplePage::tuples)
    }

    /// Shared-append view for concurrent writers.
    pub fn atomic_appender(&mut self) -> TableAppender<'_> {
        TableAppender {
            tuple_size: self.schema.tuple_size(),
            page_size: self.page_size,
            pages: Mutex::new(&mut self.pages),
        }
    }

    /// Writes every tuple as one line of `sep`-delimited text.
    pub fn write_pretty<W: Write>(&self, mut out: W, sep: char) -> io::Result<()> {
        for tuple in self.iter() {
            writeln!(out, "{}", self.schema.pretty_print(tuple, sep))?;
        }
        out.flush()
    }

    pub fn into_cursor(self) -> TableCursor {
        TableCursor::new(Arc::new(self))
    }
}

/// Appends to a table from several threads at once.
///
/// One table-wide lock serialises slot reservation only; the tuple bytes are
/// copied after the lock is released.
pub struct TableAppender<'a> {
    tuple_size: usize,
    page_size: usize,
    pages: Mutex<&'a mut Vec<TuplePage>>,
}

impl TableAppender<'_> {
    pub fn append(&self, src: &[u8]) {
        assert!(src.len() >= self.tuple_size);
        let dst = {
            let mut guard = self.pages.lock();
            let pages: &mut Vec<TuplePage> = &mut guard;
            let (page, offset) = reserve_slot(pages, self.page_size, self.tuple_size);
            pages[page].slot_ptr(offset)
        };
        // SAFETY: the slot was reserved for this call alone. Page blocks never
        // move, and nothing reads or frees them while the appender holds the
        // table's unique borrow.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst, self.tuple_size) }
    }
}

/// A page handed out by a [`TupleSource`], with its page number in the
/// backing table.
#[derive(Copy, Clone)]
pub struct SourcePage<'a> {
    pub id: usize,
    pub page: &'a TuplePage,
}

impl<'a> SourcePage<'a> {
    /// Tuples of the page with their back-references.
    pub fn tuples(&self) -> impl Iterator<Item = (TupleRef, &'a [u8])> + 'a {
        let id = self.id;
        self.page
            .tuples()
            .enumerate()
            .map(move |(slot, t)| (TupleRef::new(id, slot), t))
    }
}

/// Paged, splittable scan over the tuples of a table.
pub trait TupleSource: Sync {
    fn schema(&self) -> &SchemaRef;

    /// Next unread page. Not safe to race with other readers of the same
    /// cursor: two callers may receive the same page.
    fn read_next(&self) -> Option<SourcePage<'_>>;

    /// Next unread page; concurrent callers each receive distinct pages.
    fn atomic_read_next(&self) -> Option<SourcePage<'_>>;

    /// Rewinds to the first page.
    fn reset(&mut self);

    /// Deals the pages out to `nthreads` disjoint cursors.
    fn split(&self, nthreads: usize) -> Vec<Self>
    where
        Self: Sized;

    /// The table the pages belong to.
    fn table(&self) -> &Arc<Table>;
}

pub struct TableCursor {
    table: Arc<Table>,
    /// Page numbers this cursor visits; `None` means every page in order.
    pages: Option<Arc<[usize]>>,
    next: AtomicUsize,
}

impl TableCursor {
    pub fn new(table: Arc<Table>) -> Self {
        Self {
            table,
            pages: None,
            next: AtomicUsize::new(0),
        }
    }

    /// Number of pages this cursor covers.
    pub fn page_count(&self) -> usize {
        match &self.pages {
            None => self.table.page_count(),
            Some(ids) => ids.len(),
        }
    }

    #[inline(always)]
    fn page_at(&self, i: usize) -> Option<SourcePage<'_>> {
        let id = match &self.pages {
            None => i,
            Some(ids) => *ids.get(i)?,
        };
        let page = self.table.pages().get(id)?;
        Some(SourcePage { id, page })
    }
}

impl Clone for TableCursor {
    /// A rewound cursor over the same pages.
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
            pages: self.pages.clone(),
            next: AtomicUsize::new(0),
        }
    }
}

impl TupleSource for TableCursor {
    fn schema(&self) -> &SchemaRef {
        self.table.schema()
    }

    fn read_next(&self) -> Option<SourcePage<'_>> {
        let i = self.next.load(Ordering::Relaxed);
        let page = self.page_at(i)?;
        self.next.store(i + 1, Ordering::Relaxed);
        Some(page)
    }

    fn atomic_read_next(&self) -> Option<SourcePage<'_>> {
        // Claiming an index is the only synchronisation needed: the pages
        // themselves are immutable behind the Arc.
        let i = self.next.fetch_add(1, Ordering::Relaxed);
        self.page_at(i)
    }

    fn reset(&mut self) {
        *self.next.get_mut() = 0;
    }

    fn split(&self, nthreads: usize) -> Vec<Self> {
        assert!(nthreads > 0);
        let mut dealt: Vec<Vec<usize>> = vec![Vec::new(); nthreads];
        for i in 0..self.page_count() {
            let id = match &self.pages {
                None => i,
                Some(ids) => ids[i],
            };
            dealt[i % nthreads].push(id);
        }
        dealt
            .into_iter()
            .map(|ids| TableCursor {
                table: Arc::clone(&self.table),
                pages: Some(ids.into()),
                next: AtomicUsize::new(0),
            })
            .collect()
    }

    fn table(&self) -> &Arc<Table> {
        &self.table
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::thread;

    use super::*;
    use crate::schema::Schema;

    fn long_schema() -> SchemaRef {
        Schema::from_spec(&["long", "long"]).unwrap().into_ref()
    }

    fn filled(n: i64, page_size: usize) -> Table {
        let schema = long_schema();
        let mut table = Table::new(Arc::clone(&schema), page_size);
        let mut t = vec![0u8; schema.tuple_size()];
        for i in 0..n {
            schema.write_long(&mut t, 0, i);
            schema.write_long(&mut t, 1, i * 10);
            table.append(&t);
        }
        table
    }

    fn keys<S: TupleSource>(source: &S) -> Vec<i64> {
        let schema = Arc::clone(source.schema());
        let mut out = Vec::new();
        while let Some(page) = source.read_next() {
            for (_, t) in page.tuples() {
                out.push(schema.as_long(t, 0));
            }
        }
        out
    }

    #[test]
    fn tuple_ref_packing() {
        let r = TupleRef::new(7, 123);
        assert_eq!(r.pack(), 7 << 32 | 123);
        assert_eq!(TupleRef::unpack(r.pack()), r);
        assert_eq!(r.to_string(), "@7:123");
    }

    #[test]
    fn append_spans_pages() {
        // 48-byte pages hold three 16-byte tuples.
        let table = filled(10, 48);
        assert_eq!(table.len(), 10);
        assert_eq!(table.page_count(), 4);
        let schema = table.schema();
        let second_page = table.tuple(TupleRef::new(1, 0)).unwrap();
        assert_eq!(schema.as_long(second_page, 0), 3);
        assert_eq!(schema.as_long(second_page, 1), 30);
        assert!(table.tuple(TupleRef::new(3, 1)).is_none());
    }

    #[test]
    fn cursor_reads_in_order_and_resets() {
        let mut cursor = filled(10, 48).into_cursor();
        assert_eq!(keys(&cursor), (0..10).collect::<Vec<_>>());
        assert!(cursor.read_next().is_none());
        cursor.reset();
        assert_eq!(keys(&cursor).len(), 10);
    }

    #[test]
    fn split_is_disjoint_and_complete() {
        let cursor = filled(100, 64).into_cursor();
        let parts = cursor.split(3);
        assert_eq!(parts.len(), 3);

        let mut seen = HashSet::new();
        let mut pages = HashSet::new();
        for part in &parts {
            while let Some(page) = part.read_next() {
                assert!(pages.insert(page.id), "page {} handed out twice", page.id);
                for (r, t) in page.tuples() {
                    assert_eq!(cursor.table().tuple(r), Some(t));
                    seen.insert(part.schema().as_long(t, 0));
                }
            }
        }
        assert_eq!(seen.len(), 100);
        assert_eq!(pages.len(), cursor.page_count());
    }

    #[test]
    fn atomic_read_hands_out_each_page_once() {
        let cursor = filled(10_000, 256).into_cursor();
        let claimed: Vec<Vec<usize>> = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        let mut ids = Vec::new();
                        while let Some(page) = cursor.atomic_read_next() {
                            ids.push(page.id);
                        }
                        ids
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let mut all: Vec<usize> = claimed.into_iter().flatten().collect();
        all.sort();
        assert_eq!(all, (0..cursor.page_count()).collect::<Vec<_>>());
    }

    #[test]
    fn concurrent_appender_loses_nothing() {
        let schema = long_schema();
        let mut table = Table::new(Arc::clone(&schema), 128);
        {
            let appender = table.atomic_appender();
            thread::scope(|s| {
                for w in 0..8i64 {
                    let appender = &appender;
                    let schema = &schema;
                    s.spawn(move || {
                        let mut t = vec![0u8; schema.tuple_size()];
                        for i in 0..1_000 {
                            schema.write_long(&mut t, 0, w * 1_000 + i);
                            schema.write_long(&mut t, 1, w);
                            appender.append(&t);
                        }
                    });
                }
            });
        }
        let mut got: Vec<i64> = table.iter().map(|t| schema.as_long(t, 0)).collect();
        got.sort();
        assert_eq!(got, (0..8_000).collect::<Vec<_>>());
        for t in table.iter() {
            assert_eq!(schema.as_long(t, 0) / 1_000, schema.as_long(t, 1));
        }
    }

    #[test]
    fn pretty_output() {
        let schema = Schema::from_spec(&["long", "char(3)", "dec"]).unwrap().into_ref();
        let mut table = Table::new(schema, 64);
        table.append_fields(&["1", "abc", "2.5"]).unwrap();
        table.append_fields(&["2", "de", "0.126"]).unwrap();
        let mut buf = Vec::new();
        table.write_pretty(&mut buf, '|').unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "1|abc|2.50\n2|de|0.13\n");
    }
}
