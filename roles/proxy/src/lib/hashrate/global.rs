//! Process-scoped hashrate keyed by worker name.
//!
//! Contract traffic names the contract address as the worker, so buyer
//! validation reads incoming hashrate from here.

use std::{sync::Arc, time::SystemTime};

use crate::collections::{Collection, HasId};

use super::{Hashrate, HashrateFactory};

pub struct WorkerHashrate {
    id: String,
    hr: Hashrate,
}

impl HasId for WorkerHashrate {
    fn id(&self) -> String {
        self.id.clone()
    }
}

impl WorkerHashrate {
    pub fn hashrate(&self) -> &Hashrate {
        &self.hr
    }
}

pub struct GlobalHashrate {
    data: Collection<WorkerHashrate>,
    factory: HashrateFactory,
}

impl GlobalHashrate {
    pub fn new(factory: HashrateFactory) -> Self {
        Self {
            data: Collection::new(),
            factory,
        }
    }

    pub fn on_submit(&self, worker_name: &str, diff: f64) {
        let (worker, _) = self.data.load_or_store(Arc::new(WorkerHashrate {
            id: worker_name.to_string(),
            hr: (self.factory)(),
        }));
        worker.hr.on_submit(diff);
    }

    pub fn last_submit_time(&self, worker_name: &str) -> Option<SystemTime> {
        self.data.load(worker_name).and_then(|w| w.hr.last_submit_time())
    }

    pub fn hashrate_ghs(&self, worker_name: &str, counter_id: &str) -> Option<f64> {
        self.data
            .load(worker_name)
            .and_then(|w| w.hr.hashrate_avg_ghs(counter_id))
    }

    pub fn hashrate_ghs_all(&self, worker_name: &str) -> Option<std::collections::HashMap<String, f64>> {
        self.data.load(worker_name).map(|w| w.hr.hashrate_avg_ghs_all())
    }

    pub fn total_work(&self, worker_name: &str) -> Option<u64> {
        self.data.load(worker_name).map(|w| w.hr.total_work())
    }

    pub fn range<F>(&self, f: F)
    where
        F: FnMut(&Arc<WorkerHashrate>) -> bool,
    {
        self.data.range(f)
    }

    /// Drops the counters for a worker so a new fulfillment starts clean.
    pub fn reset(&self, worker_name: &str) {
        self.data.delete(worker_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashrate;

    #[test]
    fn submits_are_keyed_by_worker() {
        let g = GlobalHashrate::new(Hashrate::default_factory());
        g.on_submit("0xabc", 1000.0);
        g.on_submit("0xabc", 1000.0);
        g.on_submit("other", 5.0);

        assert_eq!(g.total_work("0xabc"), Some(2000));
        assert_eq!(g.total_work("other"), Some(5));
        assert_eq!(g.total_work("unknown"), None);
    }

    #[test]
    fn reset_forgets_worker() {
        let g = GlobalHashrate::new(Hashrate::default_factory());
        g.on_submit("w", hashrate::ghs_to_job_submitted(100.0));
        assert!(g.last_submit_time("w").is_some());
        g.reset("w");
        assert!(g.last_submit_time("w").is_none());
    }
}
