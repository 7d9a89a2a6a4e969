//! Task text to integer id mapping.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Dense, insertion-ordered catalog of task strings.
///
/// Ids are assigned in first-seen order starting at 0 and never change once
/// assigned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct TaskCatalog {
    tasks: Vec<String>,
    ids: HashMap<String, u32>,
}

/// One `meta/tasks.jsonl` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub task_index: u32,
    pub task: String,
}

impl TaskCatalog {
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    #[must_use]
    pub fn id_of(&self, task: &str) -> Option<u32> {
        self.ids.get(task).copied()
    }

    #[must_use]
    pub fn task(&self, id: u32) -> Option<&str> {
        self.tasks.get(id as usize).map(String::as_str)
    }

    /// Return the id for `task`, assigning the next free id if it is new.
    pub fn get_or_insert(&mut self, task: &str) -> u32 {
        if let Some(id) = self.ids.get(task) {
            return *id;
        }
        // Safety: catalogs never approach u32::MAX distinct tasks.
        #[allow(clippy::cast_possible_truncation)]
        let id = self.tasks.len() as u32;
        self.tasks.push(task.to_string());
        self.ids.insert(task.to_string(), id);
        id
    }

    /// Entries in id order.
    pub fn entries(&self) -> impl Iterator<Item = TaskEntry> + '_ {
        self.tasks.iter().map(|task| TaskEntry {
            task_index: self.ids[task],
            task: task.clone(),
        })
    }
}

impl From<Vec<String>> for TaskCatalog {
    fn from(tasks: Vec<String>) -> Self {
        let mut catalog = Self::default();
        for task in &tasks {
            catalog.get_or_insert(task);
        }
        catalog
    }
}

impl From<TaskCatalog> for Vec<String> {
    fn from(catalog: TaskCatalog) -> Self {
        catalog.tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_dense_and_stable() {
        let mut catalog = TaskCatalog::default();
        assert_eq!(catalog.get_or_insert("pick cube"), 0);
        assert_eq!(catalog.get_or_insert("open drawer"), 1);
        assert_eq!(catalog.get_or_insert("pick cube"), 0);
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.task(1), Some("open drawer"));
        assert_eq!(catalog.id_of("close drawer"), None);
    }

    #[test]
    fn serializes_as_plain_list() {
        let catalog = TaskCatalog::from(vec!["a".to_string(), "b".to_string()]);
        let json = serde_json::to_string(&catalog).unwrap();
        assert_eq!(json, r#"["a","b"]"#);
        let back: TaskCatalog = serde_json::from_str(&json).unwrap();
        assert_eq!(back, catalog);
        assert_eq!(back.id_of("b"), Some(1));
    }

    #[test]
    fn duplicate_entries_collapse_on_load() {
        let catalog = TaskCatalog::from(vec!["a".to_string(), "a".to_string()]);
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn entries_follow_id_order() {
        let catalog = TaskCatalog::from(vec!["x".to_string(), "y".to_string()]);
        let entries: Vec<TaskEntry> = catalog.entries().collect();
        assert_eq!(entries[1].task_index, 1);
        assert_eq!(entries[1].task, "y");
    }

    proptest::proptest! {
        #[test]
        fn first_seen_order_assigns_ids(tasks in proptest::collection::vec("[a-d]{1,3}", 0..32)) {
            let mut catalog = TaskCatalog::default();
            let ids: Vec<u32> = tasks.iter().map(|t| catalog.get_or_insert(t)).collect();
            for (task, id) in tasks.iter().zip(&ids) {
                proptest::prop_assert_eq!(catalog.task(*id), Some(task.as_str()));
            }
            // Ids are dense: every id below len is assigned.
            proptest::prop_assert_eq!(ids.iter().copied().max().map_or(0, |m| m as usize + 1), catalog.len());
            let reloaded = TaskCatalog::from(Vec::<String>::from(catalog.clone()));
            proptest::prop_assert_eq!(reloaded, catalog);
        }
    }
}
