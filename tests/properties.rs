//! Property-based tests for the invariants the runtime is supposed to hold
//! regardless of the exact sequence of inbound RPCs: at-most-one handler
//! per transaction, page send linearity, pending-map soundness, and
//! monotonic log ordering. Driven against a [`FakeCommunicator`], the same
//! way [`crate::scenarios`] exercises the literal end-to-end scenarios.

#![expect(clippy::unwrap_used, reason = "test code can panic")]
#![expect(clippy::expect_used, reason = "test code can panic")]
#![expect(clippy::indexing_slicing, reason = "test code with known bounds")]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chronicals_host::ctx::{HandlerCtx, NoopNotifyDelegate, Organization};
use chronicals_host::model::{
    AccessPolicy, ActionHandler, Environment, PageHandler, Route, RouteFlags, RouteKind, RouteTree, User,
};
use chronicals_host::page::{OpenPageInput, PageManager, PageRef, PageResult};
use chronicals_host::pending::PendingStore;
use chronicals_host::rpc::{RpcClient, schema};
use chronicals_host::test_support::FakeCommunicator;
use chronicals_host::transaction::{ActionRef, NoopOnErrorHook, StartTransactionInput, TransactionManager};
use proptest::prelude::*;
use serde_json::{Value, json};
use tokio::sync::RwLock;

use common::{TEST_MAX_ATTEMPTS, TEST_RETRY_INTERVAL, bind_rpc, call_count, spawn_auto_responder};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Runtime::new().expect("current-thread runtime builds")
}

fn test_user() -> User {
    User {
        first_name: "Ada".into(),
        last_name: "Lovelace".into(),
        email: None,
    }
}

fn single_route_table(route: Route) -> Arc<RwLock<RouteTree>> {
    let mut table = RouteTree::new();
    table.insert(route);
    Arc::new(RwLock::new(table))
}

fn action_route(slug: &str, handler: Arc<dyn ActionHandler>) -> Route {
    Route {
        slug: slug.into(),
        name: None,
        description: None,
        access: AccessPolicy::default(),
        flags: RouteFlags::default(),
        group: None,
        kind: RouteKind::Action(handler),
    }
}

fn page_route(slug: &str, handler: Arc<dyn PageHandler>) -> Route {
    Route {
        slug: slug.into(),
        name: None,
        description: None,
        access: AccessPolicy::default(),
        flags: RouteFlags::default(),
        group: None,
        kind: RouteKind::Page(handler, RouteTree::new()),
    }
}

proptest! {
    /// Invariant 1: however many times `START_TRANSACTION` arrives for the
    /// same id — a duplicate delivery is always possible, the orchestrator
    /// makes no uniqueness guarantee over the wire — the handler runs at
    /// most once and exactly one `MARK_TRANSACTION_COMPLETE` goes out.
    #[test]
    fn duplicate_start_transaction_runs_handler_at_most_once(repeats in 1usize..6usize) {
        runtime().block_on(async move {
            let (rpc, fake) = bind_rpc().await;
            let responder = spawn_auto_responder(Arc::clone(&fake), |method, _inputs| {
                (method == "MARK_TRANSACTION_COMPLETE").then(|| json!({"type": "SUCCESS"}))
            });

            let invocations = Arc::new(AtomicUsize::new(0));
            let handler_invocations = Arc::clone(&invocations);
            let handler: Arc<dyn ActionHandler> = Arc::new(move |_io, _ctx| {
                let call_invocations = Arc::clone(&handler_invocations);
                async move {
                    call_invocations.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"done": true}))
                }
            });

            let routes = single_route_table(action_route("once", handler));
            let pending = Arc::new(PendingStore::new());
            let shutting_down = Arc::new(AtomicBool::new(false));
            let organization = Arc::new(RwLock::new(Organization::default()));
            let transactions = TransactionManager::new(
                routes,
                Arc::clone(&rpc),
                pending,
                shutting_down,
                organization,
                Arc::new(NoopNotifyDelegate),
                Arc::new(NoopOnErrorHook),
                None,
                TEST_MAX_ATTEMPTS,
                TEST_RETRY_INTERVAL,
            );

            for _ in 0..repeats {
                transactions
                    .start_transaction(StartTransactionInput {
                        transaction_id: "dup".into(),
                        action: ActionRef { slug: "once".into() },
                        user: test_user(),
                        environment: Environment::Development,
                        params: Value::Null,
                        params_meta: None,
                        display_resolves_immediately: false,
                    })
                    .await;
            }

            for _ in 0..50 {
                if invocations.load(Ordering::SeqCst) > 0 && transactions.live_count().await == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            responder.abort();

            prop_assert_eq!(invocations.load(Ordering::SeqCst), 1);
            prop_assert_eq!(call_count(&fake, "MARK_TRANSACTION_COMPLETE").await, 1);
            Ok(())
        })?;
    }
}

proptest! {
    /// Invariant 2: no matter how many updates a page handler fires off in a
    /// burst, the [`FakeCommunicator`] never observes two `SEND_PAGE` calls
    /// in flight at once, and the last one it does see carries the final
    /// instruction.
    #[test]
    fn page_updates_never_send_concurrently(burst in 2usize..8usize) {
        runtime().block_on(async move {
            let schemas = schema::default_registry().expect("default schema registry is well-formed");
            let rpc = RpcClient::new(schemas, Duration::from_millis(200));
            let (fake, events_rx) = FakeCommunicator::new();
            rpc.set_communicator(fake.clone(), events_rx).await;
            fake.set_send_delay(Duration::from_millis(15)).await;

            let responder = spawn_auto_responder(Arc::clone(&fake), |method, _inputs| {
                (method == "SEND_PAGE").then(|| json!({"type": "SUCCESS"}))
            });

            let handler: Arc<dyn PageHandler> = Arc::new(move |io, _ctx| async move {
                let followups = Arc::clone(&io);
                tokio::spawn(async move {
                    for step in 0..burst {
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        let _ = followups.send(json!([{"v": step}])).await;
                    }
                });
                Ok(PageResult {
                    title: None,
                    description: None,
                    children: vec![json!({"v": "initial"})],
                    menu_items: Vec::new(),
                })
            });

            let routes = single_route_table(page_route("dashboard", handler));
            let pending = Arc::new(PendingStore::new());
            let shutting_down = Arc::new(AtomicBool::new(false));
            let organization = Arc::new(RwLock::new(Organization {
                id: "org1".into(),
                name: "Org One".into(),
            }));
            let pages = PageManager::new(
                routes,
                Arc::clone(&rpc),
                pending,
                shutting_down,
                organization,
                Arc::new(NoopNotifyDelegate),
                Duration::from_millis(5),
                TEST_MAX_ATTEMPTS,
            );

            pages
                .open_page(OpenPageInput {
                    page_key: "p1".into(),
                    page: PageRef { slug: "dashboard".into() },
                    user: test_user(),
                    environment: Environment::Development,
                    params: Value::Null,
                    params_meta: None,
                })
                .await
                .expect("open_page accepted");

            tokio::time::sleep(Duration::from_millis(400)).await;
            responder.abort();

            let sent = fake.sent().await;
            let last_page_call = sent
                .iter()
                .rev()
                .find(|v| v.get("method").and_then(Value::as_str) == Some("SEND_PAGE"))
                .expect("at least one SEND_PAGE recorded");
            let last_page = last_page_call["inputs"]["page"].as_str().expect("page payload is a string");

            prop_assert_eq!(fake.peak_in_flight_sends(), 1);
            prop_assert!(last_page.contains(&format!("\"v\":{}", burst - 1)));
            Ok(())
        })?;
    }
}

proptest! {
    /// Invariant 3: once `SEND_IO_CALL` is acked, the pending-IO entry for
    /// that transaction is gone; once a transaction is canceled, it stays
    /// gone regardless of how many artifacts were pending beforehand.
    #[test]
    fn pending_io_entry_is_cleared_after_ack_and_after_cancel(extra_loading_updates in 0usize..4usize) {
        runtime().block_on(async move {
            let (rpc, fake) = bind_rpc().await;
            let responder = spawn_auto_responder(Arc::clone(&fake), |method, _inputs| match method {
                "SEND_IO_CALL" | "SEND_LOADING_CALL" => Some(json!({"type": "SUCCESS"})),
                _ => None,
            });

            let handler: Arc<dyn ActionHandler> = Arc::new(move |io, ctx| async move {
                for i in 0..extra_loading_updates {
                    ctx.set_loading(json!({"step": i})).await?;
                }
                io.send(json!({"prompt": "go?"})).await?;
                let answer = io.await_response().await?;
                Ok(json!({"answer": answer}))
            });

            let routes = single_route_table(action_route("ack", handler));
            let pending = Arc::new(PendingStore::new());
            let shutting_down = Arc::new(AtomicBool::new(false));
            let organization = Arc::new(RwLock::new(Organization::default()));
            let transactions = TransactionManager::new(
                routes,
                Arc::clone(&rpc),
                Arc::clone(&pending),
                shutting_down,
                organization,
                Arc::new(NoopNotifyDelegate),
                Arc::new(NoopOnErrorHook),
                None,
                TEST_MAX_ATTEMPTS,
                TEST_RETRY_INTERVAL,
            );

            transactions
                .start_transaction(StartTransactionInput {
                    transaction_id: "ack1".into(),
                    action: ActionRef { slug: "ack".into() },
                    user: test_user(),
                    environment: Environment::Development,
                    params: Value::Null,
                    params_meta: None,
                    display_resolves_immediately: false,
                })
                .await;

            for _ in 0..50 {
                if call_count(&fake, "SEND_IO_CALL").await >= 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }

            // The ack clears pendingIO; nothing further is awaiting delivery
            // for this transaction.
            prop_assert!(pending.get_io("ack1").await.is_none());

            transactions
                .route_io_response("ack1", json!({"transactionId": "ack1", "value": "yes"}))
                .await;
            for _ in 0..50 {
                if transactions.live_count().await == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            responder.abort();

            prop_assert!(pending.get_io("ack1").await.is_none());
            prop_assert!(pending.get_loading("ack1").await.is_none());
            Ok(())
        })?;
    }
}

proptest! {
    /// Invariant 5: successive `log(...)` calls on one [`HandlerCtx`] carry
    /// strictly increasing `index` values starting at 0, no matter how many
    /// lines are emitted.
    #[test]
    fn log_indices_increase_monotonically_from_zero(line_count in 1usize..12usize) {
        runtime().block_on(async move {
            let (rpc, fake) = bind_rpc().await;
            let responder = spawn_auto_responder(Arc::clone(&fake), |method, _inputs| {
                (method == "SEND_LOG").then(|| json!({"type": "SUCCESS"}))
            });

            let ctx = HandlerCtx::new(
                "scope1".into(),
                test_user(),
                Value::Null,
                Environment::Development,
                Organization::default(),
                None,
                Arc::clone(&rpc),
                Arc::new(PendingStore::new()),
                Arc::new(NoopNotifyDelegate),
                TEST_MAX_ATTEMPTS,
                TEST_RETRY_INTERVAL,
            );

            for i in 0..line_count {
                ctx.log(&[format!("line {i}").into()]).await.expect("log send succeeds");
            }
            responder.abort();

            let sent = fake.sent().await;
            let indices: Vec<u64> = sent
                .iter()
                .filter(|v| v.get("method").and_then(Value::as_str) == Some("SEND_LOG"))
                .filter_map(|v| v["inputs"]["index"].as_u64())
                .collect();
            prop_assert_eq!(indices.len(), line_count);
            for (position, index) in indices.iter().enumerate() {
                prop_assert_eq!(*index, position as u64);
            }
            Ok(())
        })?;
    }
}
