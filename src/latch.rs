use std::collections::HashSet;

use crate::common::PeripheralId;
use crate::{Error, Result};

/// Set of peripherals that currently have a connect attempt in flight.
#[derive(Debug, Default)]
pub(crate) struct ConnectionLatch {
    connecting: HashSet<PeripheralId>,
}

impl ConnectionLatch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn acquire(&mut self, id: &PeripheralId) -> Result<()> {
        if self.connecting.insert(id.clone()) {
            Ok(())
        } else {
            Err(Error::ConnectInProgress(id.clone()))
        }
    }

    /// Returns `false` if the latch was not held, so a terminal callback can
    /// tell whether it is the first one for this attempt.
    pub(crate) fn release(&mut self, id: &PeripheralId) -> bool {
        self.connecting.remove(id)
    }

    pub(crate) fn is_held(&self, id: &PeripheralId) -> bool {
        self.connecting.contains(id)
    }
}
