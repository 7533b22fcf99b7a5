//! Lazy depth-first directory walk.

use std::collections::VecDeque;

use super::Index;
use crate::error::Result;
use crate::types::{DirInfo, FileInfo, Order};

/// Iterator over `(dir, subdirs, files)` triples, depth-first.
///
/// Each directory is listed only when the iterator reaches it, so walking a
/// huge tree starts yielding immediately. The yielded subdir vector is the
/// same set the walk will descend into next.
pub struct Walk<'a> {
    index: &'a Index,
    queue: VecDeque<DirInfo>,
}

impl<'a> Walk<'a> {
    pub(crate) fn new(index: &'a Index, root: DirInfo) -> Self {
        let mut queue = VecDeque::new();
        queue.push_back(root);
        Walk { index, queue }
    }

    fn step(&mut self) -> Result<Option<(DirInfo, Vec<DirInfo>, Vec<FileInfo>)>> {
        let Some(dinfo) = self.queue.pop_front() else {
            return Ok(None);
        };
        let subdirs = if dinfo.num_subdirs > 0 {
            self.index.list_subdir_dirinfos(&dinfo.path, Order::Any)?
        } else {
            Vec::new()
        };
        let files = if dinfo.num_files > 0 {
            self.index.list_direct_fileinfos(&dinfo.path, Order::Any)?
        } else {
            Vec::new()
        };
        for sub in subdirs.iter().rev() {
            self.queue.push_front(sub.clone());
        }
        Ok(Some((dinfo, subdirs, files)))
    }
}

impl Iterator for Walk<'_> {
    type Item = Result<(DirInfo, Vec<DirInfo>, Vec<FileInfo>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.step().transpose()
    }
}
