//! Node split: quadratic partition of a page's entries into two groups.

use super::mbr::Mbr;

/// Share of the bytes each group must end up with.
pub const RTR_SPLIT_MIN_FILL_PCT: usize = 40;

/// One entry taking part in a split.
#[derive(Debug, Clone, Copy)]
pub struct SplitEntry {
    pub mbr: Mbr,
    /// Stored record size
    pub size: usize,
}

/// Outcome of [`split_entries`]: entry indexes per group.
#[derive(Debug, Clone)]
pub struct SplitGroups {
    pub left: Vec<usize>,
    pub right: Vec<usize>,
    pub left_mbr: Mbr,
    pub right_mbr: Mbr,
}

struct Group {
    members: Vec<usize>,
    mbr: Mbr,
    bytes: usize,
}

impl Group {
    fn seeded(i: usize, e: &SplitEntry) -> Self {
        Self {
            members: vec![i],
            mbr: e.mbr,
            bytes: e.size,
        }
    }

    fn add(&mut self, i: usize, e: &SplitEntry) {
        self.members.push(i);
        self.mbr = self.mbr.union(&e.mbr);
        self.bytes += e.size;
    }
}

/// Pair whose covering rectangle wastes the most area.
fn pick_seeds(entries: &[SplitEntry]) -> (usize, usize) {
    let mut best = (0, 1);
    let mut worst_waste = f64::NEG_INFINITY;
    for i in 0..entries.len() {
        for j in i + 1..entries.len() {
            let a = &entries[i].mbr;
            let b = &entries[j].mbr;
            let waste = a.union(b).area() - a.area() - b.area();
            if waste > worst_waste {
                worst_waste = waste;
                best = (i, j);
            }
        }
    }
    best
}

/// Splits `entries` (at least two) into two groups, each holding at least
/// [`RTR_SPLIT_MIN_FILL_PCT`] percent of the bytes where the sizes allow it.
pub fn split_entries(entries: &[SplitEntry]) -> Option<SplitGroups> {
    if entries.len() < 2 {
        return None;
    }
    let total: usize = entries.iter().map(|e| e.size).sum();
    let min_bytes = total * RTR_SPLIT_MIN_FILL_PCT / 100;

    let (s1, s2) = pick_seeds(entries);
    let mut left = Group::seeded(s1, &entries[s1]);
    let mut right = Group::seeded(s2, &entries[s2]);
    let mut rest: Vec<usize> = (0..entries.len()).filter(|&i| i != s1 && i != s2).collect();
    let mut rest_bytes: usize = rest.iter().map(|&i| entries[i].size).sum();

    while !rest.is_empty() {
        // a group that needs everything left to reach its minimum gets it
        if left.bytes + rest_bytes <= min_bytes {
            for i in rest.drain(..) {
                left.add(i, &entries[i]);
            }
            break;
        }
        if right.bytes + rest_bytes <= min_bytes {
            for i in rest.drain(..) {
                right.add(i, &entries[i]);
            }
            break;
        }

        // pick the entry with the strongest preference for one group
        let (pos, d_left, d_right) = rest
            .iter()
            .enumerate()
            .map(|(pos, &i)| {
                let m = &entries[i].mbr;
                (pos, left.mbr.enlargement(m), right.mbr.enlargement(m))
            })
            .max_by(|a, b| (a.1 - a.2).abs().total_cmp(&(b.1 - b.2).abs()))?;
        let i = rest.swap_remove(pos);
        rest_bytes -= entries[i].size;

        let to_left = match d_left.total_cmp(&d_right) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => match left.mbr.area().total_cmp(&right.mbr.area()) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Greater => false,
                std::cmp::Ordering::Equal => left.bytes <= right.bytes,
            },
        };
        if to_left {
            left.add(i, &entries[i]);
        } else {
            right.add(i, &entries[i]);
        }
    }

    Some(SplitGroups {
        left: left.members,
        right: right.members,
        left_mbr: left.mbr,
        right_mbr: right.mbr,
    })
}
