use super::replacer::{FrameId, Replacer};
use std::collections::{HashSet, VecDeque};

#[derive(Debug)]
pub struct LruReplacer {
    /// Evictable frames, least recently used at the front
    lru_list: VecDeque<FrameId>,
    members: HashSet<FrameId>,
    max_size: usize,
}

impl LruReplacer {
    pub fn new(max_size: usize) -> Self {
        Self {
            lru_list: VecDeque::with_capacity(max_size),
            members: HashSet::with_capacity(max_size),
            max_size,
        }
    }

    fn remove(&mut self, frame_id: FrameId) -> bool {
        if !self.members.remove(&frame_id) {
            return false;
        }
        if let Some(pos) = self.lru_list.iter().position(|&f| f == frame_id) {
            self.lru_list.remove(pos);
        }
        true
    }
}

impl Replacer for LruReplacer {
    fn evict(&mut self) -> Option<FrameId> {
        let frame_id = self.lru_list.pop_front()?;
        self.members.remove(&frame_id);
        Some(frame_id)
    }

    fn pin(&mut self, frame_id: FrameId) {
        self.remove(frame_id);
    }

    fn unpin(&mut self, frame_id: FrameId) {
        if !self.members.contains(&frame_id) && self.lru_list.len() < self.max_size {
            self.lru_list.push_back(frame_id);
            self.members.insert(frame_id);
        }
    }

    fn make_young(&mut self, frame_id: FrameId) {
        if self.remove(frame_id) {
            self.lru_list.push_back(frame_id);
            self.members.insert(frame_id);
        }
    }

    fn size(&self) -> usize {
        self.lru_list.len()
    }
}
