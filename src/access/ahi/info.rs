//! Per-index search statistics that decide which prefix to hash and when a
//! leaf page is worth hashing.

use crate::config::AhiConfig;
use crate::storage::page::record::RecMatch;
use crate::storage::page::PageId;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashMap;

/// The hashed prefix: `n_fields` whole fields plus `n_bytes` of the next.
/// With `left_side`, the leftmost of several records sharing a fold is
/// hashed, otherwise the rightmost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashParams {
    pub n_fields: usize,
    pub n_bytes: usize,
    pub left_side: bool,
}

impl Default for HashParams {
    fn default() -> Self {
        Self {
            n_fields: 1,
            n_bytes: 0,
            left_side: true,
        }
    }
}

/// Where a leaf search ended.
#[derive(Debug, Clone, Copy)]
pub struct LeafSearch {
    pub page_id: PageId,
    pub n_recs: usize,
    pub low_match: RecMatch,
    pub up_match: RecMatch,
    /// A hash guess was tried and failed before the tree search.
    pub hash_failed: bool,
}

/// What to do with the leaf page after a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAdvice {
    Nothing,
    /// Hash the whole page with these parameters.
    Build(HashParams),
    /// Add the record the search found, the page is already hashed.
    UpdateRef(HashParams),
}

#[derive(Debug, Clone, Copy)]
struct PageHelps {
    n_helps: u32,
    params: HashParams,
}

#[derive(Debug, Default)]
struct InfoInner {
    params: HashParams,
    n_hash_potential: u32,
    hash_analysis: u32,
    last_hash_succ: bool,
    n_hash_succ: u64,
    n_hash_fail: u64,
    page_helps: HashMap<PageId, PageHelps>,
    /// Hash index epoch the statistics were gathered in.
    epoch: u64,
}

/// Search statistics of one index.
#[derive(Debug, Default)]
pub struct SearchInfo {
    inner: Mutex<InfoInner>,
}

fn pair_cmp(a_fields: usize, a_bytes: usize, b_fields: usize, b_bytes: usize) -> Ordering {
    (a_fields, a_bytes).cmp(&(b_fields, b_bytes))
}

impl SearchInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parameters to guess with, if the last searches suggest a guess pays.
    pub fn guess_params(&self) -> Option<HashParams> {
        let inner = self.inner.lock();
        (inner.last_hash_succ && inner.n_hash_potential > 0).then_some(inner.params)
    }

    pub fn current_params(&self) -> HashParams {
        self.inner.lock().params
    }

    pub fn n_hash_potential(&self) -> u32 {
        self.inner.lock().n_hash_potential
    }

    /// (successful, failed) guesses.
    pub fn guess_counts(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.n_hash_succ, inner.n_hash_fail)
    }

    pub(crate) fn record_guess(&self, success: bool, build_limit: u32) {
        let mut inner = self.inner.lock();
        if success {
            inner.last_hash_succ = true;
            inner.n_hash_succ += 1;
            if inner.n_hash_potential < build_limit + 5 {
                inner.n_hash_potential += 1;
            }
        } else {
            inner.last_hash_succ = false;
            inner.n_hash_fail += 1;
        }
    }

    /// Starts the analysis over if the hash index was disabled since these
    /// statistics were gathered. Guess counters are kept.
    pub(crate) fn sync_epoch(&self, epoch: u64) {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            Self::reset(&mut inner);
            inner.epoch = epoch;
        }
    }

    fn reset(inner: &mut InfoInner) {
        inner.params = HashParams::default();
        inner.n_hash_potential = 0;
        inner.hash_analysis = 0;
        inner.last_hash_succ = false;
        inner.page_helps.clear();
    }

    pub(crate) fn forget_page(&self, page_id: PageId) {
        self.inner.lock().page_helps.remove(&page_id);
    }

    /// Feeds one finished leaf search into the statistics.
    ///
    /// `page_hashed` is the parameter set the page is currently hashed with.
    pub(crate) fn update(
        &self,
        config: &AhiConfig,
        n_uniq: usize,
        search: &LeafSearch,
        page_hashed: Option<HashParams>,
    ) -> HashAdvice {
        let mut inner = self.inner.lock();
        inner.hash_analysis += 1;
        if inner.hash_analysis < config.hash_analysis_limit {
            return HashAdvice::Nothing;
        }
        Self::update_recommendation(&mut inner, n_uniq, search);
        let build = Self::update_page_helps(&mut inner, config, search, page_hashed);

        if search.hash_failed && inner.n_hash_potential > 0 {
            if let Some(params) = page_hashed {
                if params == inner.params {
                    return HashAdvice::UpdateRef(params);
                }
            }
        }
        if build {
            return HashAdvice::Build(inner.params);
        }
        HashAdvice::Nothing
    }

    fn update_recommendation(inner: &mut InfoInner, n_uniq: usize, search: &LeafSearch) {
        let low = search.low_match;
        let up = search.up_match;
        let params = inner.params;

        if inner.n_hash_potential > 0 {
            if params.n_fields >= n_uniq && up.fields >= n_uniq {
                inner.n_hash_potential += 1;
                return;
            }
            let vs_low = pair_cmp(params.n_fields, params.n_bytes, low.fields, low.bytes);
            let low_ok = if params.left_side {
                vs_low == Ordering::Greater
            } else {
                vs_low != Ordering::Greater
            };
            if low_ok {
                let vs_up = pair_cmp(params.n_fields, params.n_bytes, up.fields, up.bytes);
                let up_ok = if params.left_side {
                    vs_up != Ordering::Greater
                } else {
                    vs_up == Ordering::Greater
                };
                if up_ok {
                    inner.n_hash_potential += 1;
                    return;
                }
            }
        }

        // a new recommendation
        inner.hash_analysis = 0;
        match pair_cmp(up.fields, up.bytes, low.fields, low.bytes) {
            Ordering::Equal => {
                inner.n_hash_potential = 0;
                inner.params = HashParams::default();
            }
            Ordering::Greater => {
                inner.n_hash_potential = 1;
                inner.params = if up.fields >= n_uniq {
                    HashParams {
                        n_fields: n_uniq,
                        n_bytes: 0,
                        left_side: true,
                    }
                } else if low.fields < up.fields {
                    HashParams {
                        n_fields: low.fields + 1,
                        n_bytes: 0,
                        left_side: true,
                    }
                } else {
                    HashParams {
                        n_fields: low.fields,
                        n_bytes: low.bytes + 1,
                        left_side: true,
                    }
                };
            }
            Ordering::Less => {
                inner.n_hash_potential = 1;
                inner.params = if low.fields >= n_uniq {
                    HashParams {
                        n_fields: n_uniq,
                        n_bytes: 0,
                        left_side: false,
                    }
                } else if low.fields > up.fields {
                    HashParams {
                        n_fields: up.fields + 1,
                        n_bytes: 0,
                        left_side: false,
                    }
                } else {
                    HashParams {
                        n_fields: up.fields,
                        n_bytes: up.bytes + 1,
                        left_side: false,
                    }
                };
            }
        }
    }

    /// Counts the searches a page would have served from the hash index.
    /// Returns whether the page should be hashed now.
    fn update_page_helps(
        inner: &mut InfoInner,
        config: &AhiConfig,
        search: &LeafSearch,
        page_hashed: Option<HashParams>,
    ) -> bool {
        inner.last_hash_succ = false;
        let params = inner.params;
        let potential = inner.n_hash_potential;

        let helps = inner.page_helps.entry(search.page_id).or_insert(PageHelps {
            n_helps: 0,
            params,
        });
        if helps.n_helps > 0 && potential > 0 && helps.params == params {
            if page_hashed == Some(params) {
                // the guess would have worked
                inner.last_hash_succ = true;
            }
            helps.n_helps += 1;
        } else {
            helps.n_helps = 1;
            helps.params = params;
        }
        let n_helps = helps.n_helps;

        let page_build_limit = config.page_build_limit.max(1) as usize;
        if potential >= config.build_limit && n_helps as usize > search.n_recs / page_build_limit {
            return page_hashed.is_none()
                || n_helps as usize > 2 * search.n_recs
                || page_hashed != Some(params);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact_hit(page: u32) -> LeafSearch {
        LeafSearch {
            page_id: PageId(page),
            n_recs: 32,
            low_match: RecMatch {
                fields: 0,
                bytes: 7,
            },
            up_match: RecMatch {
                fields: 1,
                bytes: 0,
            },
            hash_failed: false,
        }
    }

    #[test]
    fn test_unique_lookups_recommend_full_key() {
        let config = AhiConfig::default();
        let info = SearchInfo::new();
        for _ in 0..config.hash_analysis_limit {
            info.update(&config, 1, &exact_hit(3), None);
        }
        let params = info.current_params();
        assert_eq!(params.n_fields, 1);
        assert!(params.left_side);
        assert_eq!(info.n_hash_potential(), 1);
    }

    #[test]
    fn test_build_advice_after_enough_potential() {
        let config = AhiConfig {
            hash_analysis_limit: 1,
            build_limit: 5,
            page_build_limit: 16,
            ..Default::default()
        };
        let info = SearchInfo::new();
        let mut advice = Vec::new();
        for _ in 0..10 {
            advice.push(info.update(&config, 1, &exact_hit(3), None));
        }
        assert!(advice.iter().any(|a| matches!(a, HashAdvice::Build(_))));
        // the guess is tried once the page is hashed with the same params
        let params = info.current_params();
        info.update(&config, 1, &exact_hit(3), Some(params));
        assert_eq!(info.guess_params(), Some(params));

        info.record_guess(false, config.build_limit);
        assert_eq!(info.guess_params(), None);
        let failed = LeafSearch {
            hash_failed: true,
            ..exact_hit(3)
        };
        assert_eq!(
            info.update(&config, 1, &failed, Some(params)),
            HashAdvice::UpdateRef(params)
        );
    }

    #[test]
    fn test_new_epoch_starts_analysis_over() {
        let config = AhiConfig {
            hash_analysis_limit: 1,
            build_limit: 5,
            ..Default::default()
        };
        let info = SearchInfo::new();
        for _ in 0..10 {
            info.update(&config, 1, &exact_hit(3), None);
        }
        let params = info.current_params();
        info.update(&config, 1, &exact_hit(3), Some(params));
        info.record_guess(true, config.build_limit);
        assert!(info.guess_params().is_some());

        info.sync_epoch(0);
        assert!(info.guess_params().is_some());
        info.sync_epoch(1);
        assert_eq!(info.guess_params(), None);
        assert_eq!(info.n_hash_potential(), 0);
        assert_eq!(info.current_params(), HashParams::default());
        assert_eq!(info.guess_counts().0, 1);
        // the helps of page 3 are gone too: one search is not enough to build
        assert_eq!(info.update(&config, 1, &exact_hit(3), None), HashAdvice::Nothing);
    }
}
