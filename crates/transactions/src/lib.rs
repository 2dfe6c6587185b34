//! Multi-document transactions for a document-oriented cluster store
//!
//! Application code hands [`Transactions::run`] a lambda of staged
//! read/write operations against any number of documents; the block
//! either fully commits or fully rolls back, across process and node
//! failures, using only the store's per-document CAS and extended
//! attributes.
//!
//! The moving parts:
//! - an attempt driver that executes the lambda, auto-commits and maps
//!   every failure through the error classifier,
//! - a retry runner with exponential backoff, jitter and an expiry gate,
//! - a cleanup subsystem fed both by this client's own attempts and by a
//!   client-record protocol that partitions the ATR space across live
//!   clients and reaps work abandoned by dead ones.
//!
//! ```ignore
//! let store = Arc::new(DocStore::new());
//! let collection = store.collection("app");
//! let transactions = Transactions::create(store);
//!
//! let result = transactions
//!     .run(move |ctx| {
//!         let collection = collection.clone();
//!         async move {
//!             ctx.insert(&collection, "order-1", json!({"total": 42})).await?;
//!             ctx.remove(&collection, "cart-1").await?;
//!             Ok(())
//!         }
//!     })
//!     .await?;
//! ```

mod attempt;
mod cleanup;
mod config;
mod context;
mod driver;
mod error;
mod repository;
mod result;
mod runner;

pub use attempt::AttemptContext;
pub use attempt::AttemptState;
pub use cleanup::{Cleaner, CleanupRequest, ClientRecordManager, CLIENT_RECORD_ID};
pub use config::{PerTransactionConfig, TransactionsConfig};
pub use error::{
    AttemptResult, ErrorClass, FinalErrorKind, OperationFailed, Result, TransactionError,
};
pub use repository::{
    atr_id_for_index, AtrEntry, AtrRepository, AtrState, DocRecord, DocState, DocumentRepository,
    KvSettings, StagedMeta, StagedOpKind, StoreAtrRepository, StoreDocumentRepository,
};
pub use result::TransactionResult;

use crate::cleanup::{ClientRecordHandle, CleanupSender};
use crate::driver::AttemptDriver;
use coral_store::DocStore;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Handle to the transactions subsystem, one per cluster connection.
///
/// Owns the local cleanup queue and the background tasks; the handle is
/// started by [`create`](Transactions::create) and wound down by
/// [`dispose`](Transactions::dispose).
pub struct Transactions {
    store: Arc<DocStore>,
    config: TransactionsConfig,
    cleanup_tx: Mutex<Option<CleanupSender>>,
    cleaner_task: Mutex<Option<JoinHandle<()>>>,
    record_manager: Mutex<Option<ClientRecordHandle>>,
    disposed: AtomicBool,
}

impl Transactions {
    /// Create a handle with the default configuration.
    pub fn create(store: Arc<DocStore>) -> Arc<Self> {
        Self::create_with(store, TransactionsConfig::default())
    }

    /// Create a handle with the given configuration, starting the
    /// configured background cleanup tasks.
    pub fn create_with(store: Arc<DocStore>, config: TransactionsConfig) -> Arc<Self> {
        let (cleanup_tx, cleanup_rx) = cleanup::channel(config.cleanup_queue_capacity);
        let (docs, atrs) = repositories(&store, &config);

        let cleaner_task = config.cleanup_client_attempts.then(|| {
            cleanup::spawn_drain(Cleaner::new(docs.clone(), atrs.clone()), cleanup_rx)
        });

        let record_manager = config.cleanup_lost_attempts.then(|| {
            ClientRecordManager::new(
                store.clone(),
                atrs.clone(),
                Cleaner::new(docs.clone(), atrs.clone()),
                config.clone(),
            )
            .start()
        });

        Arc::new(Self {
            store,
            config,
            cleanup_tx: Mutex::new(Some(cleanup_tx)),
            cleaner_task: Mutex::new(cleaner_task),
            record_manager: Mutex::new(record_manager),
            disposed: AtomicBool::new(false),
        })
    }

    /// Run a transaction with the client configuration.
    pub async fn run<F, Fut>(&self, lambda: F) -> Result<TransactionResult>
    where
        F: Fn(AttemptContext) -> Fut,
        Fut: Future<Output = AttemptResult<()>>,
    {
        self.run_with(lambda, PerTransactionConfig::default()).await
    }

    /// Run a transaction with per-transaction overrides.
    pub async fn run_with<F, Fut>(
        &self,
        lambda: F,
        overrides: PerTransactionConfig,
    ) -> Result<TransactionResult>
    where
        F: Fn(AttemptContext) -> Fut,
        Fut: Future<Output = AttemptResult<()>>,
    {
        let Some(cleanup_tx) = self.cleanup_tx.lock().clone() else {
            return Err(TransactionError::Failed {
                cause: OperationFailed::app("transactions handle is disposed"),
                result: TransactionResult {
                    transaction_id: String::new(),
                    unstaging_complete: false,
                },
            });
        };

        let effective = self.config.apply(&overrides);
        let (docs, atrs) = repositories(&self.store, &effective);
        let driver = AttemptDriver::new(docs, atrs, cleanup_tx);
        runner::run_transaction(&driver, effective, lambda).await
    }

    /// Stop accepting work, drain the local cleanup queue (awaited) and
    /// stop the client record manager.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Closing the sender lets the drain task finish the backlog.
        self.cleanup_tx.lock().take();
        let cleaner_task = self.cleaner_task.lock().take();
        if let Some(task) = cleaner_task {
            let _ = task.await;
        }
        let record_manager = self.record_manager.lock().take();
        if let Some(handle) = record_manager {
            handle.stop().await;
        }
    }
}

impl Drop for Transactions {
    fn drop(&mut self) {
        // Dispose is the graceful path; dropping without it only aborts
        // the background tasks.
        if let Some(task) = self.cleaner_task.lock().take() {
            task.abort();
        }
        if let Some(handle) = self.record_manager.lock().take() {
            handle.abort();
        }
    }
}

fn repositories(
    store: &Arc<DocStore>,
    config: &TransactionsConfig,
) -> (Arc<dyn DocumentRepository>, Arc<dyn AtrRepository>) {
    let kv = KvSettings {
        durability: config.durability_level,
        timeout: config.key_value_timeout,
    };
    let docs: Arc<dyn DocumentRepository> =
        Arc::new(StoreDocumentRepository::new(store.clone(), kv.clone()));
    let atrs: Arc<dyn AtrRepository> = Arc::new(StoreAtrRepository::new(
        store.clone(),
        config.metadata_collection.clone(),
        kv,
    ));
    (docs, atrs)
}
