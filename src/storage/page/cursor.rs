//! Binary search within an index page.

use super::record::{cmp_tuple_rec_with_match, RecMatch};
use super::PageBuf;
use crate::access::tuple::Tuple;
use std::cmp::Ordering;

/// Positioning mode for a page search.
///
/// `G`/`GE` position on the first record greater (or equal), `L`/`LE` on the
/// last record less (or equal) than the search tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageCurMode {
    G,
    GE,
    L,
    LE,
}

/// Outcome of [`PageBuf::search_with_match`].
#[derive(Debug, Clone, Copy)]
pub struct PageSearch {
    /// Record the cursor is positioned on (may be infimum or supremum).
    pub rec: usize,
    pub low_rec: usize,
    pub up_rec: usize,
    pub low_match: RecMatch,
    pub up_match: RecMatch,
}

impl PageBuf {
    /// Binary search over the directory followed by a linear scan inside the
    /// owning slot.
    pub fn search_with_match(&self, tuple: &Tuple, mode: PageCurMode) -> PageSearch {
        let goes_low = |ord: Ordering| match ord {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => matches!(mode, PageCurMode::G | PageCurMode::LE),
        };

        let mut low = 0;
        let mut up = self.n_dir_slots() - 1;
        let mut low_match = RecMatch::default();
        let mut up_match = RecMatch::default();

        while up - low > 1 {
            let mid = (low + up) / 2;
            let rec = self.dir_slot(mid);
            let mut m = RecMatch::default();
            let ord = cmp_tuple_rec_with_match(tuple, self, rec, &mut m);
            if goes_low(ord) {
                low = mid;
                low_match = m;
            } else {
                up = mid;
                up_match = m;
            }
        }

        let mut low_rec = self.dir_slot(low);
        let mut up_rec = self.dir_slot(up);
        loop {
            let mid_rec = self.rec_next(low_rec);
            if mid_rec == up_rec || mid_rec == 0 {
                break;
            }
            let mut m = RecMatch::default();
            let ord = cmp_tuple_rec_with_match(tuple, self, mid_rec, &mut m);
            if goes_low(ord) {
                low_rec = mid_rec;
                low_match = m;
            } else {
                up_rec = mid_rec;
                up_match = m;
                break;
            }
        }

        let rec = match mode {
            PageCurMode::G | PageCurMode::GE => up_rec,
            PageCurMode::L | PageCurMode::LE => low_rec,
        };
        PageSearch {
            rec,
            low_rec,
            up_rec,
            low_match,
            up_match,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::value::encode_u64;
    use crate::storage::page::record::RecStatus;
    use crate::storage::page::{PageId, PageType};

    fn page_with_even_keys(n: u64) -> PageBuf {
        let mut page = PageBuf::new_temp(PageId(1));
        page.page_create(0, 1, PageType::Index);
        let mut cur = page.infimum();
        for i in 0..n {
            let t = Tuple::from_slices(&[&encode_u64(i * 2)]);
            cur = page.insert_rec_after(cur, &t, RecStatus::Ordinary).unwrap().unwrap();
        }
        page
    }

    fn key_at(page: &PageBuf, rec: usize) -> Option<u64> {
        if !page.rec_is_user(rec) {
            return None;
        }
        page.rec_field(rec, 0)
            .map(crate::access::value::decode_u64)
    }

    fn search_key(i: u64) -> Tuple {
        Tuple::from_slices(&[&encode_u64(i)])
    }

    #[test]
    fn test_search_modes_on_hit() {
        let page = page_with_even_keys(100);
        let t = search_key(40);
        assert_eq!(key_at(&page, page.search_with_match(&t, PageCurMode::GE).rec), Some(40));
        assert_eq!(key_at(&page, page.search_with_match(&t, PageCurMode::G).rec), Some(42));
        assert_eq!(key_at(&page, page.search_with_match(&t, PageCurMode::LE).rec), Some(40));
        assert_eq!(key_at(&page, page.search_with_match(&t, PageCurMode::L).rec), Some(38));
        let s = page.search_with_match(&t, PageCurMode::LE);
        assert_eq!(s.low_match.fields, 1);
    }

    #[test]
    fn test_search_modes_on_miss() {
        let page = page_with_even_keys(100);
        let t = search_key(41);
        assert_eq!(key_at(&page, page.search_with_match(&t, PageCurMode::GE).rec), Some(42));
        assert_eq!(key_at(&page, page.search_with_match(&t, PageCurMode::LE).rec), Some(40));
    }

    #[test]
    fn test_search_bounds() {
        let page = page_with_even_keys(100);
        let below = page.search_with_match(&search_key(0), PageCurMode::L);
        assert_eq!(below.rec, page.infimum());
        let above = page.search_with_match(&search_key(1000), PageCurMode::G);
        assert_eq!(above.rec, page.supremum());

        let empty = page_with_even_keys(0);
        let s = empty.search_with_match(&search_key(5), PageCurMode::LE);
        assert_eq!(s.rec, empty.infimum());
    }
}
