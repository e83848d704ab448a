//! Ordered child collections
//!
//! Children of embedded nodes are held in a plain list. Children of
//! relational nodes are counted first; when there are more rows than one
//! segment holds, the list is split into fixed-size [`Segment`]s that are
//! fetched one at a time when an index inside them is accessed.
//!
//! All operations take the list lock for their whole duration, segment
//! loading included.

use crate::core::{Error, Result};
use crate::mapping::Relation;
use crate::node::handle::NodeHandle;
use crate::node::node::NodeRef;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Default number of children per segment
pub const DEFAULT_SEGMENT_LENGTH: usize = 1000;

/// Backend access needed to fill a relational child list
pub trait SubnodeSource {
    /// Number of rows `relation` yields for `home`
    fn count_subnodes(&self, home: &NodeRef, relation: &Relation) -> Result<usize>;

    /// Handles of the rows `relation` yields for `home`, honoring the
    /// relation's offset and max size
    fn subnode_handles(&self, home: &NodeRef, relation: &Relation) -> Result<Vec<NodeHandle>>;

    /// Current data change counter of the relation's target storage
    fn last_data_change(&self, relation: &Relation) -> u64;
}

/// Home node plus the source to load its children from
#[derive(Clone, Copy)]
pub struct Loader<'a> {
    pub home: &'a NodeRef,
    pub source: &'a dyn SubnodeSource,
}

impl<'a> Loader<'a> {
    pub fn new(home: &'a NodeRef, source: &'a dyn SubnodeSource) -> Self {
        Self { home, source }
    }
}

/// Window of the child list
///
/// `start` and `length` describe the slots in the list and move with local
/// inserts and removals. `offset` and `rows` describe the stored rows the
/// segment was counted from and stay fixed until the next recount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub start: usize,
    pub length: usize,
    pub offset: usize,
    pub rows: usize,
    pub loaded: bool,
}

impl Segment {
    fn new(start: usize, length: usize) -> Self {
        Self {
            start,
            length,
            offset: start,
            rows: length,
            loaded: false,
        }
    }
}

#[derive(Default)]
struct ListState {
    list: Vec<Option<NodeHandle>>,
    segments: Option<Vec<Segment>>,
    last_fetch: Option<u64>,
}

/// Child list of a node, segmented when large and relational
pub struct SegmentedSubnodeList {
    relation: Option<Relation>,
    segment_length: usize,
    state: Mutex<ListState>,
    inconsistent: AtomicU64,
}

impl SegmentedSubnodeList {
    /// In-memory list
    pub fn simple() -> Self {
        Self {
            relation: None,
            segment_length: DEFAULT_SEGMENT_LENGTH,
            state: Mutex::new(ListState::default()),
            inconsistent: AtomicU64::new(0),
        }
    }

    /// In-memory list holding `handles`
    pub fn from_handles(handles: Vec<NodeHandle>) -> Self {
        let list = Self::simple();
        list.state.lock().list = handles.into_iter().map(Some).collect();
        list
    }

    /// List backed by `relation`, segmented above `segment_length` rows
    pub fn relational(relation: Relation, segment_length: usize) -> Self {
        Self {
            relation: Some(relation),
            segment_length: segment_length.max(1),
            state: Mutex::new(ListState::default()),
            inconsistent: AtomicU64::new(0),
        }
    }

    pub fn relation(&self) -> Option<&Relation> {
        self.relation.as_ref()
    }

    pub fn is_relational(&self) -> bool {
        self.relation.is_some()
    }

    pub fn segment_length(&self) -> usize {
        self.segment_length
    }

    /// Whether the list is currently split into segments
    pub fn is_segmented(&self) -> bool {
        self.state.lock().segments.is_some()
    }

    /// Copy of the current segment table
    pub fn segments(&self) -> Option<Vec<Segment>> {
        self.state.lock().segments.clone()
    }

    /// Number of segment loads whose row count didn't match the segment
    pub fn inconsistent_loads(&self) -> u64 {
        self.inconsistent.load(Ordering::Relaxed)
    }

    /// Force a recount on next access
    pub fn invalidate(&self) {
        self.state.lock().last_fetch = None;
    }

    /// Re-read the collection if the target storage changed since the last
    /// fetch. Only the row count is queried for large collections.
    pub fn update(&self, loader: Option<Loader<'_>>) -> Result<()> {
        let mut st = self.state.lock();
        self.update_locked(&mut st, loader)
    }

    fn update_locked(&self, st: &mut ListState, loader: Option<Loader<'_>>) -> Result<()> {
        let (Some(rel), Some(ld)) = (&self.relation, loader) else {
            return Ok(());
        };

        let change = ld.source.last_data_change(rel);
        if st.last_fetch == Some(change) {
            return Ok(());
        }

        let count = ld.source.count_subnodes(ld.home, rel)?;
        if count > self.segment_length {
            let mut segments = Vec::with_capacity(count / self.segment_length + 1);
            let mut start = 0;
            while start < count {
                let length = self.segment_length.min(count - start);
                segments.push(Segment::new(start, length));
                start += length;
            }
            debug!(rows = count, segments = segments.len(), "Segmented subnode list");
            st.segments = Some(segments);
            st.list = vec![None; count];
        } else {
            let handles = ld.source.subnode_handles(ld.home, rel)?;
            st.segments = None;
            st.list = handles.into_iter().map(Some).collect();
        }
        st.last_fetch = Some(change);
        Ok(())
    }

    fn segment_index(segments: &[Segment], index: usize) -> usize {
        segments.iter().rposition(|s| s.start <= index).unwrap_or(0)
    }

    fn load_segment(&self, st: &mut ListState, seg: usize, loader: Option<Loader<'_>>) -> Result<()> {
        let (Some(rel), Some(ld)) = (&self.relation, loader) else {
            return Ok(());
        };
        let Some(segment) = st.segments.as_ref().and_then(|s| s.get(seg)).copied() else {
            return Ok(());
        };
        if segment.loaded {
            return Ok(());
        }

        let handles = if segment.rows == 0 {
            Vec::new()
        } else {
            let window = rel.window(segment.offset, segment.rows);
            ld.source.subnode_handles(ld.home, &window)?
        };

        if handles.len() != segment.rows {
            self.inconsistent.fetch_add(1, Ordering::Relaxed);
            warn!(
                segment = seg,
                offset = segment.offset,
                expected = segment.rows,
                fetched = handles.len(),
                "Inconsistent segment load, collection changed while loading"
            );
        }

        // stored rows go into the empty slots in order; slots of local
        // inserts and appends keep their handle
        let end = (segment.start + segment.length).min(st.list.len());
        let start = segment.start.min(end);
        let empty = st.list[start..end].iter_mut().filter(|slot| slot.is_none());
        for (slot, handle) in empty.zip(handles) {
            *slot = Some(handle);
        }
        if let Some(s) = st.segments.as_mut().and_then(|s| s.get_mut(seg)) {
            s.loaded = true;
        }
        Ok(())
    }

    /// Number of children
    pub fn size(&self, loader: Option<Loader<'_>>) -> Result<usize> {
        let mut st = self.state.lock();
        self.update_locked(&mut st, loader)?;
        Ok(st.list.len())
    }

    /// Child at `index`, loading its segment if needed
    pub fn get(&self, index: usize, loader: Option<Loader<'_>>) -> Result<Option<NodeHandle>> {
        let mut st = self.state.lock();
        self.update_locked(&mut st, loader)?;
        if index >= st.list.len() {
            return Ok(None);
        }
        if st.list[index].is_none() {
            let seg = st.segments.as_deref().map(|s| Self::segment_index(s, index));
            if let Some(seg) = seg {
                self.load_segment(&mut st, seg, loader)?;
            }
        }
        Ok(st.list[index].clone())
    }

    /// Append a child
    pub fn add(&self, handle: NodeHandle, loader: Option<Loader<'_>>) -> Result<()> {
        let mut st = self.state.lock();
        self.update_locked(&mut st, loader)?;
        st.list.push(Some(handle));
        if let Some(last) = st.segments.as_mut().and_then(|s| s.last_mut()) {
            last.length += 1;
        }
        Ok(())
    }

    /// Insert a child at `index`, shifting later segments
    pub fn insert(&self, index: usize, handle: NodeHandle, loader: Option<Loader<'_>>) -> Result<()> {
        let mut st = self.state.lock();
        self.update_locked(&mut st, loader)?;
        if index > st.list.len() {
            return Err(Error::invalid_input(format!(
                "Index {} out of bounds for {} subnodes",
                index,
                st.list.len()
            )));
        }
        st.list.insert(index, Some(handle));
        if let Some(segments) = st.segments.as_mut() {
            let seg = Self::segment_index(segments, index);
            segments[seg].length += 1;
            for s in segments.iter_mut().skip(seg + 1) {
                s.start += 1;
            }
        }
        Ok(())
    }

    /// Remove the child at `index`, shifting later segments
    pub fn remove(&self, index: usize, loader: Option<Loader<'_>>) -> Result<Option<NodeHandle>> {
        let mut st = self.state.lock();
        self.update_locked(&mut st, loader)?;
        if index >= st.list.len() {
            return Ok(None);
        }
        self.remove_locked(&mut st, index, loader)
    }

    fn remove_locked(
        &self,
        st: &mut ListState,
        index: usize,
        loader: Option<Loader<'_>>,
    ) -> Result<Option<NodeHandle>> {
        let seg = st.segments.as_deref().map(|s| Self::segment_index(s, index));
        if let Some(seg) = seg {
            self.load_segment(st, seg, loader)?;
            if let Some(segments) = st.segments.as_mut() {
                segments[seg].length = segments[seg].length.saturating_sub(1);
                for s in segments.iter_mut().skip(seg + 1) {
                    s.start = s.start.saturating_sub(1);
                }
            }
        }
        Ok(st.list.remove(index))
    }

    /// Remove `handle`, returning whether it was present
    pub fn remove_handle(&self, handle: &NodeHandle, loader: Option<Loader<'_>>) -> Result<bool> {
        let mut st = self.state.lock();
        self.update_locked(&mut st, loader)?;
        match self.index_of_locked(&mut st, handle, loader)? {
            Some(index) => {
                self.remove_locked(&mut st, index, loader)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn index_of_locked(
        &self,
        st: &mut ListState,
        handle: &NodeHandle,
        loader: Option<Loader<'_>>,
    ) -> Result<Option<usize>> {
        let Some(count) = st.segments.as_ref().map(Vec::len) else {
            return Ok(st.list.iter().position(|h| h.as_ref() == Some(handle)));
        };
        for seg in 0..count {
            self.load_segment(st, seg, loader)?;
            let Some(segment) = st.segments.as_ref().map(|s| s[seg]) else {
                break;
            };
            let end = (segment.start + segment.length).min(st.list.len());
            if let Some(pos) = st.list[segment.start.min(end)..end]
                .iter()
                .position(|h| h.as_ref() == Some(handle))
            {
                return Ok(Some(segment.start + pos));
            }
        }
        Ok(None)
    }

    /// Position of `handle`, loading segments until it is found
    pub fn index_of(&self, handle: &NodeHandle, loader: Option<Loader<'_>>) -> Result<Option<usize>> {
        let mut st = self.state.lock();
        self.update_locked(&mut st, loader)?;
        self.index_of_locked(&mut st, handle, loader)
    }

    /// Whether `handle` is a child
    pub fn contains(&self, handle: &NodeHandle, loader: Option<Loader<'_>>) -> Result<bool> {
        Ok(self.index_of(handle, loader)?.is_some())
    }

    /// All children. Loads every segment of a segmented list.
    pub fn to_array(&self, loader: Option<Loader<'_>>) -> Result<Vec<NodeHandle>> {
        let mut st = self.state.lock();
        self.update_locked(&mut st, loader)?;
        if let Some(count) = st.segments.as_ref().map(Vec::len) {
            warn!(
                size = st.list.len(),
                segments = count,
                "Loading all segments of a segmented subnode list"
            );
            for seg in 0..count {
                self.load_segment(&mut st, seg, loader)?;
            }
        }
        Ok(st.list.iter().flatten().cloned().collect())
    }

    /// Children currently in memory, without loading anything
    pub fn loaded_handles(&self) -> Vec<NodeHandle> {
        self.state.lock().list.iter().flatten().cloned().collect()
    }
}

impl std::fmt::Debug for SegmentedSubnodeList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("SegmentedSubnodeList")
            .field("relational", &self.relation.is_some())
            .field("len", &st.list.len())
            .field("segments", &st.segments.as_ref().map(Vec::len))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{Interner, Key, TypeProperties};
    use crate::node::node::{Node, SharedNode};
    use std::sync::atomic::AtomicUsize;

    /// Synthetic backing store of `rows` children with ids "0".."rows-1"
    struct Rows {
        interner: Interner,
        rows: usize,
        change: AtomicU64,
        counts: AtomicUsize,
        loads: Mutex<Vec<(usize, Option<usize>)>>,
        short_by: usize,
    }

    impl Rows {
        fn new(rows: usize) -> Self {
            Self {
                interner: Interner::new(),
                rows,
                change: AtomicU64::new(1),
                counts: AtomicUsize::new(0),
                loads: Mutex::new(Vec::new()),
                short_by: 0,
            }
        }

        fn handle(&self, id: usize) -> NodeHandle {
            NodeHandle::persistent(Key::db(self.interner.intern("Story"), id.to_string()))
        }
    }

    impl SubnodeSource for Rows {
        fn count_subnodes(&self, _home: &NodeRef, _rel: &Relation) -> Result<usize> {
            self.counts.fetch_add(1, Ordering::SeqCst);
            Ok(self.rows)
        }

        fn subnode_handles(&self, _home: &NodeRef, rel: &Relation) -> Result<Vec<NodeHandle>> {
            self.loads.lock().push((rel.offset, rel.max_size));
            let end = rel.max_size.map_or(self.rows, |m| (rel.offset + m).min(self.rows));
            let end = end.saturating_sub(self.short_by).max(rel.offset);
            Ok((rel.offset..end).map(|i| self.handle(i)).collect())
        }

        fn last_data_change(&self, _rel: &Relation) -> u64 {
            self.change.load(Ordering::SeqCst)
        }
    }

    fn relation() -> Relation {
        let mut props = TypeProperties::new();
        props.insert("_children", "collection(Story)");
        props.insert("_children.foreign", "SITE_ID");
        Relation::parse("Site", "_children", "collection(Story)", &props).unwrap()
    }

    fn home() -> NodeRef {
        SharedNode::new(Node::with_id("1", Some("Site")))
    }

    #[test]
    fn test_size_needs_no_segment_load() {
        let rows = Rows::new(2500);
        let home = home();
        let list = SegmentedSubnodeList::relational(relation(), 1000);

        assert_eq!(list.size(Some(Loader::new(&home, &rows))).unwrap(), 2500);
        assert!(rows.loads.lock().is_empty());
        assert_eq!(
            list.segments().unwrap(),
            vec![Segment::new(0, 1000), Segment::new(1000, 1000), Segment::new(2000, 500)]
        );
    }

    #[test]
    fn test_get_loads_only_containing_segment() {
        let rows = Rows::new(2500);
        let home = home();
        let ld = Some(Loader::new(&home, &rows));
        let list = SegmentedSubnodeList::relational(relation(), 1000);

        let handle = list.get(2400, ld).unwrap().unwrap();
        assert_eq!(handle.id(), "2400");
        assert_eq!(*rows.loads.lock(), vec![(2000, Some(500))]);

        let loaded: Vec<bool> = list.segments().unwrap().iter().map(|s| s.loaded).collect();
        assert_eq!(loaded, vec![false, false, true]);

        // same segment again: no new query, no recount
        list.get(2001, ld).unwrap();
        assert_eq!(rows.loads.lock().len(), 1);
        assert_eq!(rows.counts.load(Ordering::SeqCst), 1);
        assert_eq!(list.inconsistent_loads(), 0);
    }

    #[test]
    fn test_recount_after_data_change() {
        let rows = Rows::new(1500);
        let home = home();
        let ld = Some(Loader::new(&home, &rows));
        let list = SegmentedSubnodeList::relational(relation(), 1000);

        list.size(ld).unwrap();
        list.size(ld).unwrap();
        assert_eq!(rows.counts.load(Ordering::SeqCst), 1);

        rows.change.fetch_add(1, Ordering::SeqCst);
        list.size(ld).unwrap();
        assert_eq!(rows.counts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_small_collection_is_not_segmented() {
        let rows = Rows::new(10);
        let home = home();
        let list = SegmentedSubnodeList::relational(relation(), 1000);
        assert_eq!(list.size(Some(Loader::new(&home, &rows))).unwrap(), 10);
        assert!(!list.is_segmented());
        assert_eq!(*rows.loads.lock(), vec![(0, None)]);
    }

    #[test]
    fn test_short_segment_is_tolerated_and_counted() {
        let mut rows = Rows::new(2500);
        rows.short_by = 3;
        let home = home();
        let ld = Some(Loader::new(&home, &rows));
        let list = SegmentedSubnodeList::relational(relation(), 1000);

        assert_eq!(list.get(0, ld).unwrap().unwrap().id(), "0");
        assert_eq!(list.inconsistent_loads(), 1);
        assert!(list.get(999, ld).unwrap().is_none());
    }

    #[test]
    fn test_insert_and_remove_shift_segments() {
        let rows = Rows::new(2500);
        let home = home();
        let ld = Some(Loader::new(&home, &rows));
        let list = SegmentedSubnodeList::relational(relation(), 1000);

        let extra = rows.handle(9999);
        list.insert(500, extra.clone(), ld).unwrap();
        let starts: Vec<usize> = list.segments().unwrap().iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![0, 1001, 2001]);
        assert_eq!(list.size(ld).unwrap(), 2501);
        assert_eq!(list.get(500, ld).unwrap(), Some(extra.clone()));
        assert_eq!(list.index_of(&extra, ld).unwrap(), Some(500));

        assert!(list.remove_handle(&extra, ld).unwrap());
        let starts: Vec<usize> = list.segments().unwrap().iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![0, 1000, 2000]);

        let removed = list.remove(1000, ld).unwrap().unwrap();
        assert_eq!(removed.id(), "1000");
        let segs = list.segments().unwrap();
        assert_eq!((segs[1].start, segs[1].length), (1000, 999));
        assert_eq!(segs[2].start, 1999);

        // the last segment now starts one slot earlier but still reads
        // the stored rows it was counted from
        assert_eq!(list.get(1999, ld).unwrap().unwrap().id(), "2000");
        assert_eq!(rows.loads.lock().last(), Some(&(2000, Some(500))));
        assert_eq!(list.inconsistent_loads(), 0);
    }

    #[test]
    fn test_insert_before_load_keeps_every_stored_row() {
        let rows = Rows::new(2500);
        let home = home();
        let ld = Some(Loader::new(&home, &rows));
        let list = SegmentedSubnodeList::relational(relation(), 1000);

        let extra = rows.handle(9999);
        list.insert(500, extra.clone(), ld).unwrap();
        let all = list.to_array(ld).unwrap();

        assert_eq!(all.len(), 2501);
        assert_eq!(all[500], extra);
        assert_eq!(all[501].id(), "500");
        let ids: std::collections::HashSet<String> = all.iter().map(NodeHandle::id).collect();
        assert_eq!(ids.len(), 2501);
        assert!((0..2500).all(|i| ids.contains(&i.to_string())));
        assert_eq!(rows.loads.lock()[0], (0, Some(1000)));
        assert_eq!(list.inconsistent_loads(), 0);
    }

    #[test]
    fn test_append_is_not_an_inconsistent_load() {
        let rows = Rows::new(2500);
        let home = home();
        let ld = Some(Loader::new(&home, &rows));
        let list = SegmentedSubnodeList::relational(relation(), 1000);

        let extra = rows.handle(9999);
        list.add(extra.clone(), ld).unwrap();
        assert_eq!(list.get(2000, ld).unwrap().unwrap().id(), "2000");
        assert_eq!(rows.loads.lock().last(), Some(&(2000, Some(500))));
        assert_eq!(list.inconsistent_loads(), 0);
        assert_eq!(list.get(2499, ld).unwrap().unwrap().id(), "2499");
        assert_eq!(list.get(2500, ld).unwrap(), Some(extra));
    }

    #[test]
    fn test_to_array_loads_everything() {
        let rows = Rows::new(2500);
        let home = home();
        let ld = Some(Loader::new(&home, &rows));
        let list = SegmentedSubnodeList::relational(relation(), 1000);
        let all = list.to_array(ld).unwrap();
        assert_eq!(all.len(), 2500);
        assert_eq!(rows.loads.lock().len(), 3);
        assert!(list.contains(&rows.handle(1234), ld).unwrap());
    }

    #[test]
    fn test_simple_list() {
        let interner = Interner::new();
        let a = NodeHandle::persistent(Key::db(interner.intern("HopObject"), "43"));
        let b = NodeHandle::persistent(Key::db(interner.intern("HopObject"), "44"));
        let list = SegmentedSubnodeList::from_handles(vec![a.clone()]);

        list.add(b.clone(), None).unwrap();
        assert_eq!(list.size(None).unwrap(), 2);
        assert_eq!(list.index_of(&b, None).unwrap(), Some(1));
        assert!(list.insert(5, b.clone(), None).is_err());
        assert_eq!(list.remove(0, None).unwrap(), Some(a.clone()));
        assert!(!list.contains(&a, None).unwrap());
        assert_eq!(list.to_array(None).unwrap(), vec![b]);
    }
}
