//! Compliance transaction.
//!
//! Wraps the storage transaction with checkpointed orphan tracking: every
//! rewriter context stages the orphans it creates, and the staged set
//! commits or vanishes together with the KV transaction. A row in the
//! default shard must appear here exactly once.

use std::collections::{HashMap, HashSet};

use k9db_sqlast::Value;

/// Orphaned pks per table.
type OrphanMap = HashMap<String, HashSet<Value>>;

#[derive(Debug, Default)]
pub struct ComplianceTransaction {
    in_ctx: bool,
    orphans: OrphanMap,
    checkpoint: Option<OrphanMap>,
}

impl ComplianceTransaction {
    pub fn new() -> ComplianceTransaction {
        ComplianceTransaction::default()
    }

    pub fn start(&mut self) {
        self.in_ctx = true;
    }

    pub fn commit(&mut self) {
        assert!(self.checkpoint.is_none(), "commit with open checkpoint");
        self.in_ctx = false;
    }

    pub fn discard(&mut self) {
        self.checkpoint = None;
        self.in_ctx = false;
    }

    /// Stage a new checkpoint. Orphans recorded from here on can be thrown
    /// away with [`rollback_checkpoint`].
    pub fn add_checkpoint(&mut self) {
        assert!(self.checkpoint.is_none(), "nested checkpoint");
        self.checkpoint = Some(HashMap::new());
    }

    pub fn rollback_checkpoint(&mut self) {
        self.checkpoint.take().expect("no checkpoint to rollback");
    }

    pub fn commit_checkpoint(&mut self) {
        let staged = self.checkpoint.take().expect("no checkpoint to commit");
        for (table, pks) in staged {
            self.orphans.entry(table).or_default().extend(pks);
        }
    }

    pub fn add_orphan(&mut self, table_name: &str, pk: Value) {
        let target = self.checkpoint.as_mut().unwrap_or(&mut self.orphans);
        target.entry(table_name.to_string()).or_default().insert(pk);
    }

    pub fn add_orphans(&mut self, table_name: &str, pks: impl IntoIterator<Item = Value>) {
        for pk in pks {
            self.add_orphan(table_name, pk);
        }
    }

    /// An update re-homed this row out of the default shard.
    pub fn remove_orphan(&mut self, table_name: &str, pk: &Value) {
        if let Some(staged) = self.checkpoint.as_mut() {
            if let Some(pks) = staged.get_mut(table_name) {
                pks.remove(pk);
            }
        }
        if let Some(pks) = self.orphans.get_mut(table_name) {
            pks.remove(pk);
        }
    }

    pub fn is_orphan(&self, table_name: &str, pk: &Value) -> bool {
        self.orphans
            .get(table_name)
            .map(|pks| pks.contains(pk))
            .unwrap_or(false)
            || self
                .checkpoint
                .as_ref()
                .and_then(|staged| staged.get(table_name))
                .map(|pks| pks.contains(pk))
                .unwrap_or(false)
    }

    pub fn orphan_count(&self, table_name: &str) -> usize {
        self.orphans
            .get(table_name)
            .map(|pks| pks.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn checkpoint_rollback_discards_staged() {
        let mut ctx = ComplianceTransaction::new();
        ctx.start();
        ctx.add_checkpoint();
        ctx.add_orphan("notes", Value::Int(1));
        assert!(ctx.is_orphan("notes", &Value::Int(1)));
        ctx.rollback_checkpoint();
        assert!(!ctx.is_orphan("notes", &Value::Int(1)));
        assert_eq!(ctx.orphan_count("notes"), 0);
    }

    #[test]
    fn checkpoint_commit_merges() {
        let mut ctx = ComplianceTransaction::new();
        ctx.start();
        ctx.add_checkpoint();
        ctx.add_orphans("notes", [Value::Int(1), Value::Int(2)]);
        ctx.commit_checkpoint();
        assert_eq!(ctx.orphan_count("notes"), 2);

        ctx.add_checkpoint();
        ctx.add_orphan("notes", Value::Int(3));
        ctx.commit_checkpoint();
        assert_eq!(ctx.orphan_count("notes"), 3);
    }

    #[test]
    fn reclaim_clears_orphan() {
        let mut ctx = ComplianceTransaction::new();
        ctx.start();
        ctx.add_checkpoint();
        ctx.add_orphan("notes", Value::Int(1));
        ctx.commit_checkpoint();
        ctx.remove_orphan("notes", &Value::Int(1));
        assert!(!ctx.is_orphan("notes", &Value::Int(1)));
    }
}
