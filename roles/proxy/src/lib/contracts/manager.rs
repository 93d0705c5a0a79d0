//! Tracks every contract this node is party to and runs one controller task
//! per contract.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    collections::{Collection, HasId},
    error::Error,
    task_manager::TaskManager,
};

use super::{
    store::{CloneFactoryEvent, ContractStore},
    Contract, ContractFactoryFn,
};

struct ContractEntry {
    id: String,
    contract: Arc<dyn Contract>,
}

impl HasId for ContractEntry {
    fn id(&self) -> String {
        self.id.clone()
    }
}

pub struct ContractManager {
    owner_address: String,

    contracts: Arc<Collection<ContractEntry>>,
    tasks: Arc<TaskManager>,

    contract_factory: ContractFactoryFn,
    store: Arc<dyn ContractStore>,
}

impl ContractManager {
    pub fn new(
        owner_address: &str,
        contract_factory: ContractFactoryFn,
        store: Arc<dyn ContractStore>,
    ) -> Self {
        Self {
            owner_address: owner_address.to_lowercase(),
            contracts: Arc::new(Collection::new()),
            tasks: Arc::new(TaskManager::new()),
            contract_factory,
            store,
        }
    }

    pub fn contracts(&self) -> Vec<Arc<dyn Contract>> {
        let mut all = vec![];
        self.contracts.range(|entry| {
            all.push(entry.contract.clone());
            true
        });
        all
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), Error> {
        // load everything that already exists on chain
        let contract_ids = self.store.contract_ids().await?;
        for id in contract_ids {
            let terms = self.store.get_terms(&id).await?;
            if self.is_our_contract(&terms.base.seller, &terms.base.buyer) {
                self.add_contract(cancel, terms);
            }
        }

        let sub = self.store.subscribe_clone_factory().await?;
        info!("subscribed to clonefactory events");

        let res = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                event = sub.events().recv() => match event {
                    Ok(event) => {
                        if let Err(e) = self.handle_clone_factory_event(cancel, event).await {
                            break Err(e);
                        }
                    }
                    Err(e) => break Err(Error::ChannelRecv(e)),
                },
                err = sub.errors().recv() => match err {
                    Ok(err) => break Err(err.into()),
                    Err(e) => break Err(Error::ChannelRecv(e)),
                },
            }
        };

        sub.unsubscribe();
        self.tasks.join_all().await;
        res
    }

    async fn handle_clone_factory_event(
        &self,
        cancel: &CancellationToken,
        event: CloneFactoryEvent,
    ) -> Result<(), Error> {
        match event {
            CloneFactoryEvent::ContractCreated { address } => {
                let terms = self.store.get_terms(&address).await?;
                if self.is_our_contract(&terms.base.seller, &terms.base.buyer) {
                    self.add_contract(cancel, terms);
                }
            }
            CloneFactoryEvent::ContractPurchased { address } => {
                let terms = self.store.get_terms(&address).await?;
                if terms.base.buyer.to_lowercase() == self.owner_address {
                    self.add_contract(cancel, terms);
                }
            }
            CloneFactoryEvent::ContractDeleteUpdated { .. } => {
                // contracts remain tracked regardless of delete status
            }
        }
        Ok(())
    }

    fn add_contract(&self, cancel: &CancellationToken, terms: super::EncryptedTerms) {
        let id = terms.base.contract_id.clone();
        if self.contracts.load(&id).is_some() {
            error!("contract {id} already exists in store");
            return;
        }

        let contract = match (self.contract_factory)(terms) {
            Ok(contract) => contract,
            Err(e) => {
                error!("contract factory error {e}");
                return;
            }
        };

        self.contracts.store(Arc::new(ContractEntry {
            id: id.clone(),
            contract: contract.clone(),
        }));

        let contracts = self.contracts.clone();
        let run_cancel = cancel.child_token();
        self.tasks.spawn(async move {
            if let Err(e) = contract.run(&run_cancel).await {
                warn!("contract {} exited: {e}", contract.id());
            }
            contracts.delete(&contract.id());
        });
    }

    fn is_our_contract(&self, seller: &str, buyer: &str) -> bool {
        seller.to_lowercase() == self.owner_address || buyer.to_lowercase() == self.owner_address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{
        store::tests::MemoryStore,
        terms::{BlockchainState, ContractRole, ContractState, ValidationStage},
        EncryptedTerms,
    };
    use async_trait::async_trait;
    use std::{
        collections::HashMap,
        sync::Mutex as StdMutex,
        time::{Duration, SystemTime},
    };

    /// A contract that just waits for cancellation, recording that it ran.
    struct IdleContract {
        terms: EncryptedTerms,
        started: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl Contract for IdleContract {
        fn id(&self) -> String {
            self.terms.base.contract_id.clone()
        }
        fn role(&self) -> ContractRole {
            ContractRole::Seller
        }
        fn state(&self) -> ContractState {
            ContractState::Pending
        }
        fn blockchain_state(&self) -> BlockchainState {
            self.terms.base.state
        }
        fn validation_stage(&self) -> ValidationStage {
            ValidationStage::NotApplicable
        }
        fn seller(&self) -> String {
            self.terms.base.seller.clone()
        }
        fn buyer(&self) -> String {
            self.terms.base.buyer.clone()
        }
        fn dest(&self) -> String {
            String::new()
        }
        fn hashrate_ghs(&self) -> f64 {
            self.terms.base.hashrate_ghs
        }
        fn starts_at(&self) -> Option<SystemTime> {
            self.terms.base.starts_at
        }
        fn end_time(&self) -> Option<SystemTime> {
            self.terms.base.end_time()
        }
        fn duration(&self) -> Duration {
            self.terms.base.duration
        }
        fn fulfillment_started_at(&self) -> Option<SystemTime> {
            None
        }
        fn hashrate_actual_ghs(&self) -> HashMap<String, f64> {
            HashMap::new()
        }
        async fn run(&self, cancel: &CancellationToken) -> Result<(), Error> {
            self.started.lock().unwrap().push(self.id());
            cancel.cancelled().await;
            Ok(())
        }
    }

    fn recording_factory(started: Arc<StdMutex<Vec<String>>>) -> ContractFactoryFn {
        Arc::new(move |terms| {
            let contract: Arc<dyn Contract> = Arc::new(IdleContract {
                terms,
                started: started.clone(),
            });
            Ok(contract)
        })
    }

    #[tokio::test]
    async fn tracks_existing_and_created_contracts_of_this_wallet() {
        let store = MemoryStore::new();
        // one of ours (as seller), one foreign
        store.put_terms(MemoryStore::test_terms("0xours", "0xme", "0xother", 100.0));
        store.put_terms(MemoryStore::test_terms(
            "0xforeign",
            "0xalice",
            "0xbob",
            100.0,
        ));

        let started = Arc::new(StdMutex::new(vec![]));
        let manager = Arc::new(ContractManager::new(
            "0xME",
            recording_factory(started.clone()),
            store.clone(),
        ));

        let cancel = CancellationToken::new();
        let run_manager = manager.clone();
        let run_cancel = cancel.clone();
        let run = tokio::spawn(async move { run_manager.run(&run_cancel).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(started.lock().unwrap().clone(), vec!["0xours".to_string()]);

        // a new contract purchased by us gets added; delete events are a
        // deliberate no-op
        store.put_terms(MemoryStore::test_terms("0xnew", "0xcarol", "0xme", 50.0));
        store
            .clone_factory_tx
            .send(CloneFactoryEvent::ContractPurchased {
                address: "0xnew".to_string(),
            })
            .await
            .unwrap();
        store
            .clone_factory_tx
            .send(CloneFactoryEvent::ContractDeleteUpdated {
                address: "0xours".to_string(),
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            started.lock().unwrap().clone(),
            vec!["0xours".to_string(), "0xnew".to_string()]
        );
        assert_eq!(manager.contracts().len(), 2);

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), run).await;
    }
}
