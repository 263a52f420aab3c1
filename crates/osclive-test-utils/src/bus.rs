//! Register bus replaying scripted reads

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use osclive_backend::register::NO_DATA;
use osclive_backend::{BackendError, RegisterBus};

#[derive(Default)]
struct BusLog {
    script: VecDeque<Vec<u8>>,
    reads: Vec<(u64, usize)>,
    writes: Vec<(u64, Vec<u8>)>,
    fail: bool,
}

/// Scripted [`RegisterBus`]; clones share the script and the access log
///
/// Once the script runs out every read returns the no-data marker.
#[derive(Clone, Default)]
pub struct ScriptedBus {
    log: Arc<Mutex<BusLog>>,
}

impl ScriptedBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next read, padded with zeros to the requested length
    pub fn push_read(&self, data: impl Into<Vec<u8>>) {
        self.log.lock().script.push_back(data.into());
    }

    /// Queue `n` reads answered with the no-data marker
    pub fn push_no_data(&self, n: usize) {
        let mut log = self.log.lock();
        for _ in 0..n {
            log.script.push_back(vec![NO_DATA]);
        }
    }

    /// Fail every subsequent access
    pub fn set_failing(&self, fail: bool) {
        self.log.lock().fail = fail;
    }

    pub fn reads(&self) -> Vec<(u64, usize)> {
        self.log.lock().reads.clone()
    }

    pub fn writes(&self) -> Vec<(u64, Vec<u8>)> {
        self.log.lock().writes.clone()
    }

    pub fn remaining(&self) -> usize {
        self.log.lock().script.len()
    }
}

impl RegisterBus for ScriptedBus {
    fn read_block(&mut self, address: u64, len: usize) -> Result<Vec<u8>, BackendError> {
        let mut log = self.log.lock();
        if log.fail {
            return Err(BackendError::ConnectionLost("bus reset".to_string()));
        }
        log.reads.push((address, len));
        let mut data = log.script.pop_front().unwrap_or_else(|| vec![NO_DATA]);
        data.resize(len.max(data.len()), 0);
        Ok(data)
    }

    fn write_block(&mut self, address: u64, data: &[u8]) -> Result<(), BackendError> {
        let mut log = self.log.lock();
        if log.fail {
            return Err(BackendError::ConnectionLost("bus reset".to_string()));
        }
        log.writes.push((address, data.to_vec()));
        Ok(())
    }
}
