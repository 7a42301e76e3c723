//! Index page layout engine.
//!
//! Single-page primitives shared by the B-tree and the R-tree: creation,
//! record insert/delete with page-directory maintenance, reorganization and
//! record-range copy/delete. Callers never touch directory slots.
//!
//! PAGE header (after the FIL header):
//!
//! ```text
//! +0  N_DIR_SLOTS u16   +2  HEAP_TOP u16   +4  N_HEAP u16    +6  FREE u16
//! +8  GARBAGE u16       +10 LAST_INSERT    +12 DIRECTION     +14 N_DIRECTION
//! +16 N_RECS u16        +18 MAX_TRX_ID u64 (autoinc on a clustered root)
//! +26 LEVEL u16         +28 INDEX_ID u64   +36 SSN u64
//! +44 SEG_LEAF u32      +48 SEG_TOP u32    +52 ZIP_SIZE u16
//! ```

use super::record::{rec_converted_size, RecStatus};
use super::{PageBuf, PageType, FIL_HEADER_SIZE, FIL_TRAILER_SIZE};
use crate::access::tuple::Tuple;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::PAGE_SIZE;

pub const PAGE_HEADER: usize = FIL_HEADER_SIZE;
const PAGE_N_DIR_SLOTS: usize = PAGE_HEADER;
const PAGE_HEAP_TOP: usize = PAGE_HEADER + 2;
const PAGE_N_HEAP: usize = PAGE_HEADER + 4;
const PAGE_FREE: usize = PAGE_HEADER + 6;
const PAGE_GARBAGE: usize = PAGE_HEADER + 8;
const PAGE_LAST_INSERT: usize = PAGE_HEADER + 10;
const PAGE_DIRECTION: usize = PAGE_HEADER + 12;
const PAGE_N_DIRECTION: usize = PAGE_HEADER + 14;
const PAGE_N_RECS: usize = PAGE_HEADER + 16;
const PAGE_MAX_TRX_ID: usize = PAGE_HEADER + 18;
const PAGE_LEVEL: usize = PAGE_HEADER + 26;
const PAGE_INDEX_ID: usize = PAGE_HEADER + 28;
const PAGE_SSN: usize = PAGE_HEADER + 36;
const PAGE_SEG_LEAF: usize = PAGE_HEADER + 44;
const PAGE_SEG_TOP: usize = PAGE_HEADER + 48;
const PAGE_ZIP_SIZE: usize = PAGE_HEADER + 52;
pub const PAGE_HEADER_SIZE: usize = 56;

pub const PAGE_INFIMUM: usize = PAGE_HEADER + PAGE_HEADER_SIZE;
const SYSTEM_REC_SIZE: usize = 19;
pub const PAGE_SUPREMUM: usize = PAGE_INFIMUM + SYSTEM_REC_SIZE;
pub const PAGE_HEAP_START: usize = PAGE_SUPREMUM + SYSTEM_REC_SIZE;

/// End of the page directory (exclusive); slot 0 sits right below it.
const PAGE_DIR: usize = PAGE_SIZE - FIL_TRAILER_SIZE;
const PAGE_DIR_SLOT_SIZE: usize = 2;
pub const PAGE_DIR_SLOT_MIN_N_OWNED: usize = 4;
pub const PAGE_DIR_SLOT_MAX_N_OWNED: usize = 8;

pub const PAGE_LEFT: u16 = 1;
pub const PAGE_RIGHT: u16 = 2;
pub const PAGE_NO_DIRECTION: u16 = 5;

/// Segment id stored in a root's segment header when none is attached.
pub const SEG_NONE: u32 = 0;

/// Bytes reserved for the directory of a page holding `n_user` heap records.
fn dir_reserved(n_user: usize) -> usize {
    PAGE_DIR_SLOT_SIZE * (2 + n_user.div_ceil(PAGE_DIR_SLOT_MIN_N_OWNED))
}

fn dir_slot_offset(i: usize) -> usize {
    PAGE_DIR - PAGE_DIR_SLOT_SIZE * (i + 1)
}

/// Directory bytes needed for `n_recs` user records.
pub fn page_dir_reserved(n_recs: usize) -> usize {
    dir_reserved(n_recs)
}

/// Bytes available to records and directory on an empty page.
pub fn page_free_space_of_empty() -> usize {
    PAGE_DIR - PAGE_HEAP_START
}

/// Largest record that fits in a freshly created page.
pub fn page_max_rec_size() -> usize {
    PAGE_DIR - PAGE_HEAP_START - dir_reserved(1)
}

impl PageBuf {
    /// Initializes an empty index page. Sibling links are reset.
    pub fn page_create(&mut self, level: usize, index_id: u64, page_type: PageType) {
        self.memset(PAGE_HEADER, PAGE_DIR - PAGE_HEADER, 0);
        self.set_page_type(page_type);
        self.set_prev(None);
        self.set_next(None);

        self.write_u16(PAGE_N_DIR_SLOTS, 2);
        self.write_u16(PAGE_HEAP_TOP, PAGE_HEAP_START as u16);
        self.write_u16(PAGE_N_HEAP, 2);
        self.write_u16(PAGE_DIRECTION, PAGE_NO_DIRECTION);
        self.write_u16(PAGE_LEVEL, level as u16);
        self.write_u64(PAGE_INDEX_ID, index_id);

        self.write_record(
            PAGE_INFIMUM,
            &Tuple::from_slices(&[b"infimum\0"]),
            RecStatus::Infimum,
            0,
        );
        self.write_record(
            PAGE_SUPREMUM,
            &Tuple::from_slices(&[b"supremum"]),
            RecStatus::Supremum,
            1,
        );
        self.rec_set_next(PAGE_INFIMUM, PAGE_SUPREMUM);
        self.rec_set_n_owned(PAGE_INFIMUM, 1);
        self.rec_set_n_owned(PAGE_SUPREMUM, 1);
        self.set_dir_slot(0, PAGE_INFIMUM);
        self.set_dir_slot(1, PAGE_SUPREMUM);
    }

    /// Resets to an empty page at `level`, keeping segment headers, sibling
    /// links, SSN, compressed size and, if asked, the MAX_TRX_ID/autoinc field.
    pub fn page_empty(&mut self, level: usize, keep_max_trx_id: bool) {
        let prev = self.prev();
        let next = self.next();
        let page_type = self.page_type();
        let index_id = self.index_id();
        let seg_leaf = self.seg_leaf();
        let seg_top = self.seg_top();
        let ssn = self.ssn();
        let zip_size = self.header_zip_size();
        let max_trx_id = self.max_trx_id();

        self.page_create(level, index_id, page_type);

        self.set_prev(prev);
        self.set_next(next);
        self.set_seg_headers(seg_leaf, seg_top);
        if ssn != 0 {
            self.set_ssn(ssn);
        }
        if zip_size != 0 {
            self.set_header_zip_size(zip_size);
        }
        if keep_max_trx_id && max_trx_id != 0 {
            self.set_max_trx_id(max_trx_id);
        }
    }

    pub fn n_dir_slots(&self) -> usize {
        self.read_u16(PAGE_N_DIR_SLOTS) as usize
    }

    pub fn heap_top(&self) -> usize {
        self.read_u16(PAGE_HEAP_TOP) as usize
    }

    pub fn n_heap(&self) -> usize {
        self.read_u16(PAGE_N_HEAP) as usize
    }

    pub fn free_head(&self) -> Option<usize> {
        match self.read_u16(PAGE_FREE) {
            0 => None,
            off => Some(off as usize),
        }
    }

    pub fn garbage(&self) -> usize {
        self.read_u16(PAGE_GARBAGE) as usize
    }

    pub fn last_insert(&self) -> Option<usize> {
        match self.read_u16(PAGE_LAST_INSERT) {
            0 => None,
            off => Some(off as usize),
        }
    }

    pub fn direction(&self) -> u16 {
        self.read_u16(PAGE_DIRECTION)
    }

    pub fn n_direction(&self) -> usize {
        self.read_u16(PAGE_N_DIRECTION) as usize
    }

    pub fn n_recs(&self) -> usize {
        self.read_u16(PAGE_N_RECS) as usize
    }

    pub fn max_trx_id(&self) -> u64 {
        self.read_u64(PAGE_MAX_TRX_ID)
    }

    pub fn set_max_trx_id(&mut self, v: u64) {
        self.write_u64(PAGE_MAX_TRX_ID, v);
    }

    pub fn level(&self) -> usize {
        self.read_u16(PAGE_LEVEL) as usize
    }

    pub fn set_level(&mut self, level: usize) {
        self.write_u16(PAGE_LEVEL, level as u16);
    }

    pub fn is_leaf(&self) -> bool {
        self.level() == 0
    }

    pub fn index_id(&self) -> u64 {
        self.read_u64(PAGE_INDEX_ID)
    }

    pub fn set_index_id(&mut self, id: u64) {
        self.write_u64(PAGE_INDEX_ID, id);
    }

    /// Split sequence number (R-tree).
    pub fn ssn(&self) -> u64 {
        self.read_u64(PAGE_SSN)
    }

    pub fn set_ssn(&mut self, ssn: u64) {
        self.write_u64(PAGE_SSN, ssn);
    }

    pub fn seg_leaf(&self) -> u32 {
        self.read_u32(PAGE_SEG_LEAF)
    }

    pub fn seg_top(&self) -> u32 {
        self.read_u32(PAGE_SEG_TOP)
    }

    pub fn set_seg_headers(&mut self, leaf: u32, top: u32) {
        self.write_u32(PAGE_SEG_LEAF, leaf);
        self.write_u32(PAGE_SEG_TOP, top);
    }

    pub fn header_zip_size(&self) -> usize {
        self.read_u16(PAGE_ZIP_SIZE) as usize
    }

    pub fn set_header_zip_size(&mut self, size: usize) {
        self.write_u16(PAGE_ZIP_SIZE, size as u16);
    }

    pub fn is_index_page(&self) -> bool {
        matches!(self.page_type(), PageType::Index | PageType::RTree)
    }

    /// Bytes of live user records.
    pub fn data_size(&self) -> usize {
        (self.heap_top() - PAGE_HEAP_START).saturating_sub(self.garbage())
    }

    /// Largest record insertable without reorganizing, assuming `n_add`
    /// more records will follow.
    pub fn max_insert_size(&self, n_add: usize) -> usize {
        let occupied = self.heap_top() + dir_reserved(self.n_heap() - 2 + n_add);
        PAGE_DIR.saturating_sub(occupied)
    }

    /// Largest record insertable after a reorganize reclaims garbage.
    pub fn max_insert_size_after_reorganize(&self, n_add: usize) -> usize {
        let occupied = PAGE_HEAP_START + self.data_size() + dir_reserved(self.n_recs() + n_add);
        PAGE_DIR.saturating_sub(occupied)
    }

    fn set_dir_slot(&mut self, i: usize, rec: usize) {
        self.write_u16(dir_slot_offset(i), rec as u16);
    }

    pub fn dir_slot(&self, i: usize) -> usize {
        self.read_u16(dir_slot_offset(i)) as usize
    }

    fn dir_start(&self) -> usize {
        PAGE_DIR - PAGE_DIR_SLOT_SIZE * self.n_dir_slots()
    }

    pub fn infimum(&self) -> usize {
        PAGE_INFIMUM
    }

    pub fn supremum(&self) -> usize {
        PAGE_SUPREMUM
    }

    pub fn first_user_rec(&self) -> Option<usize> {
        match self.rec_next(PAGE_INFIMUM) {
            PAGE_SUPREMUM => None,
            rec => Some(rec),
        }
    }

    pub fn next_user_rec(&self, rec: usize) -> Option<usize> {
        match self.rec_next(rec) {
            PAGE_SUPREMUM | 0 => None,
            next => Some(next),
        }
    }

    pub fn last_user_rec(&self) -> Option<usize> {
        match self.rec_prev(PAGE_SUPREMUM) {
            PAGE_INFIMUM => None,
            rec => Some(rec),
        }
    }

    /// User records in key order.
    pub fn user_recs(&self) -> Vec<usize> {
        let mut recs = Vec::with_capacity(self.n_recs());
        let mut rec = self.rec_next(PAGE_INFIMUM);
        while rec != PAGE_SUPREMUM && rec != 0 && recs.len() <= self.n_recs() {
            recs.push(rec);
            rec = self.rec_next(rec);
        }
        recs
    }

    /// Directory slot owning `rec`.
    pub fn find_owner_slot(&self, rec: usize) -> StorageResult<usize> {
        let mut owner = rec;
        let mut steps = 0;
        while self.rec_n_owned(owner) == 0 {
            owner = self.rec_next(owner);
            steps += 1;
            if owner == 0 || steps > PAGE_DIR_SLOT_MAX_N_OWNED {
                return Err(StorageError::corruption(
                    self.page_id(),
                    format!("record {} has no directory owner", rec),
                ));
            }
        }
        (0..self.n_dir_slots())
            .find(|&i| self.dir_slot(i) == owner)
            .ok_or_else(|| {
                StorageError::corruption(
                    self.page_id(),
                    format!("owner record {} missing from directory", owner),
                )
            })
    }

    /// Predecessor of `rec` in key order; infimum for the first record.
    pub fn rec_prev(&self, rec: usize) -> usize {
        if rec == PAGE_INFIMUM {
            return PAGE_INFIMUM;
        }
        let start = match self.find_owner_slot(rec) {
            Ok(0) | Err(_) => PAGE_INFIMUM,
            Ok(slot) => self.dir_slot(slot - 1),
        };
        let mut prev = start;
        let mut cur = self.rec_next(prev);
        while cur != rec && cur != 0 {
            prev = cur;
            cur = self.rec_next(cur);
        }
        prev
    }

    /// Opens a new directory slot at index `at`, shifting the later slots.
    fn dir_insert_slot(&mut self, at: usize) {
        let n = self.n_dir_slots();
        let src = dir_slot_offset(n - 1);
        self.memmove(src - PAGE_DIR_SLOT_SIZE, src, PAGE_DIR_SLOT_SIZE * (n - at));
        self.write_u16(PAGE_N_DIR_SLOTS, (n + 1) as u16);
    }

    fn dir_delete_slot(&mut self, slot: usize) {
        let n = self.n_dir_slots();
        let src = dir_slot_offset(n - 1);
        let len = PAGE_DIR_SLOT_SIZE * (n - 1 - slot);
        if len > 0 {
            self.memmove(src + PAGE_DIR_SLOT_SIZE, src, len);
        }
        self.write_u16(src, 0);
        self.write_u16(PAGE_N_DIR_SLOTS, (n - 1) as u16);
    }

    /// Splits a slot owning more than the maximum into two halves.
    fn dir_split_slot(&mut self, slot: usize) {
        let owner = self.dir_slot(slot);
        let n_owned = self.rec_n_owned(owner);
        let mut rec = self.dir_slot(slot - 1);
        for _ in 0..n_owned / 2 {
            rec = self.rec_next(rec);
        }
        self.dir_insert_slot(slot);
        self.set_dir_slot(slot, rec);
        self.rec_set_n_owned(rec, n_owned / 2);
        self.rec_set_n_owned(owner, n_owned - n_owned / 2);
    }

    /// Restores the minimum ownership of `slot` by borrowing from or merging
    /// with the slot above it. The last slot is exempt.
    fn dir_balance_owned_slot(&mut self, slot: usize) {
        let n_slots = self.n_dir_slots();
        if slot == 0 || slot + 1 >= n_slots {
            return;
        }
        let owner = self.dir_slot(slot);
        let n_owned = self.rec_n_owned(owner);
        let up_owner = self.dir_slot(slot + 1);
        let up_n_owned = self.rec_n_owned(up_owner);

        if up_n_owned > PAGE_DIR_SLOT_MIN_N_OWNED {
            let new_owner = self.rec_next(owner);
            self.rec_set_n_owned(owner, 0);
            self.rec_set_n_owned(new_owner, n_owned + 1);
            self.set_dir_slot(slot, new_owner);
            self.rec_set_n_owned(up_owner, up_n_owned - 1);
        } else {
            self.rec_set_n_owned(up_owner, up_n_owned + n_owned);
            self.rec_set_n_owned(owner, 0);
            self.dir_delete_slot(slot);
        }
    }

    /// Inserts `tuple` right after `cur`. Returns the new record offset, or
    /// `None` when the page has no room.
    pub fn insert_rec_after(
        &mut self,
        cur: usize,
        tuple: &Tuple,
        status: RecStatus,
    ) -> StorageResult<Option<usize>> {
        if cur == PAGE_SUPREMUM {
            return Err(StorageError::corruption(
                self.page_id(),
                "insert position after supremum",
            ));
        }
        let size = rec_converted_size(tuple);

        let (at, heap_no) = match self.free_head() {
            Some(free) if self.rec_size(free) == size => {
                let next_free = self.rec_next(free);
                let heap_no = self.rec_heap_no(free);
                self.write_u16(PAGE_FREE, next_free as u16);
                self.write_u16(PAGE_GARBAGE, (self.garbage() - size) as u16);
                (free, heap_no)
            }
            _ => {
                if size > self.max_insert_size(1) {
                    return Ok(None);
                }
                let at = self.heap_top();
                let heap_no = self.n_heap();
                self.write_u16(PAGE_HEAP_TOP, (at + size) as u16);
                self.write_u16(PAGE_N_HEAP, (heap_no + 1) as u16);
                (at, heap_no)
            }
        };

        self.write_record(at, tuple, status, heap_no);
        let next = self.rec_next(cur);
        self.rec_set_next(at, next);
        self.rec_set_next(cur, at);
        self.write_u16(PAGE_N_RECS, (self.n_recs() + 1) as u16);

        match self.last_insert() {
            Some(last) if last == cur && self.direction() != PAGE_LEFT => {
                self.write_u16(PAGE_DIRECTION, PAGE_RIGHT);
                self.write_u16(PAGE_N_DIRECTION, (self.n_direction() + 1) as u16);
            }
            Some(last) if self.direction() != PAGE_RIGHT && next == last => {
                self.write_u16(PAGE_DIRECTION, PAGE_LEFT);
                self.write_u16(PAGE_N_DIRECTION, (self.n_direction() + 1) as u16);
            }
            _ => {
                self.write_u16(PAGE_DIRECTION, PAGE_NO_DIRECTION);
                self.write_u16(PAGE_N_DIRECTION, 0);
            }
        }
        self.write_u16(PAGE_LAST_INSERT, at as u16);

        let slot = self.find_owner_slot(at)?;
        let owner = self.dir_slot(slot);
        let n_owned = self.rec_n_owned(owner) + 1;
        self.rec_set_n_owned(owner, n_owned);
        if n_owned > PAGE_DIR_SLOT_MAX_N_OWNED {
            self.dir_split_slot(slot);
        }
        Ok(Some(at))
    }

    /// Unlinks a user record and puts it on the free list. Returns its size.
    pub fn delete_rec(&mut self, rec: usize) -> StorageResult<usize> {
        if !self.rec_is_user(rec) {
            return Err(StorageError::corruption(
                self.page_id(),
                format!("delete of system record {}", rec),
            ));
        }
        let slot = self.find_owner_slot(rec)?;
        let owner = self.dir_slot(slot);
        let prev = self.rec_prev(rec);
        let next = self.rec_next(rec);
        let size = self.rec_size(rec);
        let n_owned = self.rec_n_owned(owner);

        self.rec_set_next(prev, next);
        if owner == rec {
            self.set_dir_slot(slot, prev);
            self.rec_set_n_owned(rec, 0);
            self.rec_set_n_owned(prev, n_owned - 1);
        } else {
            self.rec_set_n_owned(owner, n_owned - 1);
        }

        let free = self.free_head().unwrap_or(0);
        self.rec_set_next(rec, free);
        let bits = self.rec_info_bits(rec) | super::record::REC_INFO_DELETED_FLAG;
        self.rec_set_info_bits(rec, bits);
        self.write_u16(PAGE_FREE, rec as u16);
        self.write_u16(PAGE_GARBAGE, (self.garbage() + size) as u16);
        self.write_u16(PAGE_N_RECS, (self.n_recs() - 1) as u16);
        self.write_u16(PAGE_LAST_INSERT, 0);

        if n_owned - 1 < PAGE_DIR_SLOT_MIN_N_OWNED {
            self.dir_balance_owned_slot(slot);
        }
        Ok(size)
    }

    /// Rebuilds the page with its records packed in key order.
    ///
    /// For a compressed page the result must recompress; otherwise the page
    /// is restored and `LayoutFailure` returned.
    pub fn reorganize(&mut self) -> StorageResult<()> {
        let mut temp = PageBuf::new_temp(self.page_id());
        temp.page_create(self.level(), self.index_id(), self.page_type());
        temp.set_max_trx_id(self.max_trx_id());
        temp.set_ssn(self.ssn());
        temp.set_seg_headers(self.seg_leaf(), self.seg_top());
        temp.set_header_zip_size(self.header_zip_size());

        let mut cur = PAGE_INFIMUM;
        for rec in self.user_recs() {
            let tuple = self.rec_to_tuple(rec);
            cur = temp
                .insert_rec_after(cur, &tuple, self.rec_status(rec))?
                .ok_or_else(|| {
                    StorageError::corruption(self.page_id(), "records do not fit on reorganize")
                })?;
        }
        if temp.n_recs() != self.n_recs() || temp.data_size() != self.data_size() {
            return Err(StorageError::corruption(
                self.page_id(),
                format!(
                    "reorganize changed n_recs {} -> {} or data_size {} -> {}",
                    self.n_recs(),
                    temp.n_recs(),
                    self.data_size(),
                    temp.data_size()
                ),
            ));
        }

        self.copy_body_from(&temp);
        if self.is_compressed() && !self.zip_compress() {
            self.zip_restore()?;
            return Err(StorageError::LayoutFailure);
        }
        Ok(())
    }

    /// Inserts copies of `recs` from `src` in order after `after`.
    /// Fails with `LayoutFailure` as soon as one does not fit; the MIN_REC
    /// flag is not carried over.
    pub fn copy_recs_after(
        &mut self,
        after: usize,
        src: &PageBuf,
        recs: &[usize],
    ) -> StorageResult<()> {
        let mut cur = after;
        for &rec in recs {
            let mut tuple = src.rec_to_tuple(rec);
            tuple.set_min_rec(false);
            cur = self
                .insert_rec_after(cur, &tuple, src.rec_status(rec))?
                .ok_or(StorageError::LayoutFailure)?;
        }
        Ok(())
    }

    /// Appends the records of `src` from `from` to the end of this page.
    pub fn copy_rec_list_end(&mut self, src: &PageBuf, from: usize) -> StorageResult<()> {
        let recs: Vec<usize> = src.user_recs().into_iter().skip_while(|&r| r != from).collect();
        let after = self.last_user_rec().unwrap_or(PAGE_INFIMUM);
        self.copy_recs_after(after, src, &recs)
    }

    /// Prepends the records of `src` before `until` (exclusive) to this page.
    pub fn copy_rec_list_start(&mut self, src: &PageBuf, until: usize) -> StorageResult<()> {
        let recs: Vec<usize> = src.user_recs().into_iter().take_while(|&r| r != until).collect();
        self.copy_recs_after(PAGE_INFIMUM, src, &recs)
    }

    /// Deletes `from` and every record after it. Returns (records, bytes).
    pub fn delete_rec_list_end(&mut self, from: usize) -> StorageResult<(usize, usize)> {
        let recs: Vec<usize> = self.user_recs().into_iter().skip_while(|&r| r != from).collect();
        self.delete_recs(&recs)
    }

    /// Deletes every record before `until` (exclusive).
    pub fn delete_rec_list_start(&mut self, until: usize) -> StorageResult<(usize, usize)> {
        let recs: Vec<usize> = self.user_recs().into_iter().take_while(|&r| r != until).collect();
        self.delete_recs(&recs)
    }

    fn delete_recs(&mut self, recs: &[usize]) -> StorageResult<(usize, usize)> {
        let mut bytes = 0;
        for &rec in recs.iter().rev() {
            bytes += self.delete_rec(rec)?;
        }
        Ok((recs.len(), bytes))
    }

    /// Checks the page-local invariants: record list, counts, directory
    /// ownership, free list and heap bounds.
    pub fn validate_page(&self) -> StorageResult<()> {
        let page_id = self.page_id();
        let corrupt = |reason: String| Err(StorageError::corruption(page_id, reason));

        if self.heap_top() > self.dir_start() || self.heap_top() < PAGE_HEAP_START {
            return corrupt(format!("heap top {} overlaps directory", self.heap_top()));
        }
        let n_slots = self.n_dir_slots();
        if n_slots < 2
            || self.dir_slot(0) != PAGE_INFIMUM
            || self.dir_slot(n_slots - 1) != PAGE_SUPREMUM
        {
            return corrupt("directory does not start at infimum and end at supremum".into());
        }

        let mut rec = PAGE_INFIMUM;
        let mut slot = 0;
        let mut owned = 0;
        let mut n_recs = 0;
        let mut data = 0;
        loop {
            owned += 1;
            let n_owned = self.rec_n_owned(rec);
            if n_owned != 0 {
                if slot >= n_slots || self.dir_slot(slot) != rec {
                    return corrupt(format!(
                        "record {} owns {} but is not slot {}",
                        rec, n_owned, slot
                    ));
                }
                if n_owned != owned {
                    return corrupt(format!(
                        "slot {} owns {} records, header says {}",
                        slot, owned, n_owned
                    ));
                }
                let (lo, hi) = if slot == 0 {
                    (1, 1)
                } else if slot == n_slots - 1 {
                    (1, PAGE_DIR_SLOT_MAX_N_OWNED)
                } else {
                    (PAGE_DIR_SLOT_MIN_N_OWNED, PAGE_DIR_SLOT_MAX_N_OWNED)
                };
                if n_owned < lo || n_owned > hi {
                    return corrupt(format!("slot {} owns {} records", slot, n_owned));
                }
                slot += 1;
                owned = 0;
            }
            if rec == PAGE_SUPREMUM {
                break;
            }
            let next = self.rec_next(rec);
            if next != PAGE_SUPREMUM && (next < PAGE_HEAP_START || next >= self.heap_top()) {
                return corrupt(format!("record {} has next pointer {}", rec, next));
            }
            if next != PAGE_SUPREMUM {
                if self.rec_is_deleted(next) {
                    return corrupt(format!("deleted record {} in record list", next));
                }
                n_recs += 1;
                data += self.rec_size(next);
                if n_recs > self.n_recs() {
                    return corrupt("record list longer than n_recs".into());
                }
            }
            rec = next;
        }
        if slot != n_slots {
            return corrupt(format!("{} of {} directory slots reached", slot, n_slots));
        }
        if n_recs != self.n_recs() {
            return corrupt(format!("n_recs {} but {} records linked", self.n_recs(), n_recs));
        }
        if data != self.data_size() {
            return corrupt(format!("data size {} but records take {}", self.data_size(), data));
        }

        let mut garbage = 0;
        let mut free = self.free_head();
        let mut n_free = 0;
        while let Some(f) = free {
            n_free += 1;
            if n_free > self.n_heap() {
                return corrupt("free list cycle".into());
            }
            garbage += self.rec_size(f);
            free = match self.rec_next(f) {
                0 => None,
                n => Some(n),
            };
        }
        if garbage != self.garbage() {
            return corrupt(format!("garbage {} but free list holds {}", self.garbage(), garbage));
        }
        if n_recs + n_free + 2 != self.n_heap() {
            return corrupt(format!(
                "n_heap {} but {} live and {} free records",
                self.n_heap(),
                n_recs,
                n_free
            ));
        }
        Ok(())
    }
}
