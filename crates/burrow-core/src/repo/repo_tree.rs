use std::sync::Arc;

use burrow_types::error::{BurrowError, Result};

use crate::forest::{Forest, Tree, TreeId};

use super::fs::RepositoryFs;

/// Lifecycle of a forest handle.
pub enum ForestState {
    /// Nothing loaded yet.
    Closed,
    /// Committed state as of when the forest was opened.
    ReadOnly(Forest),
    /// Accepting changes. `current` is the tree being written, if any.
    Open {
        forest: Forest,
        current: Option<TreeId>,
    },
}

/// A forest living in one toplevel directory of the repository.
pub struct RepositoryTree {
    fs: Arc<RepositoryFs>,
    dirname: String,
    key_size: usize,
    node_size: usize,
    keep_just_one_tree: bool,
    state: ForestState,
}

impl RepositoryTree {
    pub fn new(
        fs: Arc<RepositoryFs>,
        dirname: &str,
        key_size: usize,
        node_size: usize,
        keep_just_one_tree: bool,
    ) -> Self {
        Self {
            fs,
            dirname: dirname.to_string(),
            key_size,
            node_size,
            keep_just_one_tree,
            state: ForestState::Closed,
        }
    }

    pub fn dirname(&self) -> &str {
        &self.dirname
    }

    pub fn state(&self) -> &ForestState {
        &self.state
    }

    fn open_forest(&self) -> Result<Forest> {
        Forest::open(
            Arc::clone(&self.fs),
            &self.dirname,
            self.key_size,
            self.node_size,
        )
    }

    /// Load the committed forest read-only if nothing is loaded yet.
    pub fn init_forest(&mut self) -> Result<()> {
        if matches!(self.state, ForestState::Closed) {
            self.state = ForestState::ReadOnly(self.open_forest()?);
        }
        Ok(())
    }

    pub fn forest(&self) -> Option<&Forest> {
        match &self.state {
            ForestState::Closed => None,
            ForestState::ReadOnly(forest) | ForestState::Open { forest, .. } => Some(forest),
        }
    }

    /// Switch to the writable state. With `create_tree`, make sure there is
    /// a current tree, cloned from the newest existing one.
    pub fn start_changes(&mut self, create_tree: bool) -> Result<()> {
        let (mut forest, current) = match std::mem::replace(&mut self.state, ForestState::Closed) {
            ForestState::Closed => (self.open_forest()?, None),
            ForestState::ReadOnly(forest) => (forest, None),
            ForestState::Open { forest, current } => (forest, current),
        };
        let current = match current {
            Some(id) => Some(id),
            None if create_tree => {
                let base = forest.last_tree_id();
                Some(forest.new_tree(base)?)
            }
            None => None,
        };
        self.state = ForestState::Open { forest, current };
        Ok(())
    }

    pub fn current(&self) -> Option<TreeId> {
        match &self.state {
            ForestState::Open { current, .. } => *current,
            _ => None,
        }
    }

    pub fn current_tree(&self) -> Option<&Tree> {
        match &self.state {
            ForestState::Open {
                forest,
                current: Some(id),
            } => forest.tree(*id),
            _ => None,
        }
    }

    pub fn current_tree_mut(&mut self) -> Option<&mut Tree> {
        match &mut self.state {
            ForestState::Open {
                forest,
                current: Some(id),
            } => forest.tree_mut(*id),
            _ => None,
        }
    }

    /// The tree this handle reads from: its working tree if it has one,
    /// otherwise the newest committed tree.
    pub fn view(&mut self) -> Result<Option<&Tree>> {
        self.init_forest()?;
        Ok(match &self.state {
            ForestState::Closed => None,
            ForestState::ReadOnly(forest) => forest.last_tree_id().and_then(|id| forest.tree(id)),
            ForestState::Open { forest, current } => current
                .or_else(|| forest.last_tree_id())
                .and_then(|id| forest.tree(id)),
        })
    }

    /// The working tree, created on demand.
    pub fn working_tree(&mut self) -> Result<&mut Tree> {
        self.start_changes(true)?;
        let dirname = self.dirname.clone();
        self.current_tree_mut()
            .ok_or_else(|| BurrowError::Other(format!("no working tree in '{dirname}'")))
    }

    /// Drop a tree from the writable forest.
    pub fn remove_tree(&mut self, id: TreeId) -> Result<bool> {
        self.start_changes(false)?;
        match &mut self.state {
            ForestState::Open { forest, current } => {
                if *current == Some(id) {
                    *current = None;
                }
                Ok(forest.remove_tree(id))
            }
            _ => Ok(false),
        }
    }

    /// Persist pending changes and fall back to read-only.
    pub fn commit(&mut self) -> Result<()> {
        if let ForestState::Open { forest, current } = &mut self.state {
            if self.keep_just_one_tree {
                let keep = current.or_else(|| forest.last_tree_id());
                for id in forest.tree_ids() {
                    if Some(id) != keep {
                        forest.remove_tree(id);
                    }
                }
            }
            forest.commit()?;
        }
        self.state = match std::mem::replace(&mut self.state, ForestState::Closed) {
            ForestState::Open { forest, .. } => ForestState::ReadOnly(forest),
            other => other,
        };
        Ok(())
    }

    /// Forget everything loaded, including uncommitted changes and the
    /// node cache.
    pub fn close(&mut self) {
        if let Some(forest) = self.forest() {
            forest.store().clear();
        }
        self.state = ForestState::Closed;
    }
}
