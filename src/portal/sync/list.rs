//! 有序记录列表
//!
//! 顺序只由 `(created_at, id)` 决定；更新原地进行，不改变位置。

use crate::portal::backend::SortDirection;
use crate::portal::sync::models::{Author, Entity, Record};
use std::cmp::Ordering;
use std::collections::HashMap;

/// 一次变更对列表的实际影响
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted(usize),
    Updated(usize),
    Removed(usize),
    Unchanged,
}

fn compare<E: Entity>(direction: SortDirection, a: &Record<E>, b: &Record<E>) -> Ordering {
    let ord = a.sort_key().cmp(&b.sort_key());
    match direction {
        SortDirection::Ascending => ord,
        SortDirection::Descending => ord.reverse(),
    }
}

#[derive(Debug, Clone)]
pub struct OrderedList<E> {
    direction: SortDirection,
    records: Vec<Record<E>>,
}

impl<E: Entity> OrderedList<E> {
    pub fn new(direction: SortDirection) -> Self {
        Self {
            direction,
            records: Vec::new(),
        }
    }

    /// 用一次批量拉取的结果替换全部内容（同 id 保留最后一条）
    pub fn replace_all(&mut self, records: Vec<Record<E>>) {
        let mut by_id: HashMap<String, Record<E>> = HashMap::with_capacity(records.len());
        for record in records {
            by_id.insert(record.id.clone(), record);
        }
        let mut records: Vec<Record<E>> = by_id.into_values().collect();
        let direction = self.direction;
        records.sort_by(|a, b| compare(direction, a, b));
        self.records = records;
    }

    /// 插入或原地更新
    ///
    /// 已存在时保留原位置和 `created_at`；推送的行不带作者时保留已有作者。
    pub fn upsert(&mut self, mut record: Record<E>) -> Applied {
        if let Some(idx) = self.position(&record.id) {
            let existing = &mut self.records[idx];
            record.created_at = existing.created_at;
            if record.author.is_none() {
                record.author = existing.author.take();
            }
            *existing = record;
            return Applied::Updated(idx);
        }

        let direction = self.direction;
        let idx = self
            .records
            .partition_point(|r| compare(direction, r, &record) == Ordering::Less);
        self.records.insert(idx, record);
        Applied::Inserted(idx)
    }

    /// 按 id 删除，不存在时不做任何事
    pub fn remove(&mut self, id: &str) -> Applied {
        match self.position(id) {
            Some(idx) => {
                self.records.remove(idx);
                Applied::Removed(idx)
            }
            None => Applied::Unchanged,
        }
    }

    /// 补全作者资料，记录已不存在时返回 None
    pub fn patch_author(&mut self, id: &str, author: Author) -> Option<usize> {
        let idx = self.position(id)?;
        self.records[idx].author = Some(author);
        Some(idx)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.records.iter().position(|r| r.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&Record<E>> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn records(&self) -> &[Record<E>] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
