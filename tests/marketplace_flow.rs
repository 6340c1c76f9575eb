//! End-to-end marketplace flows: submit, claim, execute and settle against
//! an in-memory store with real provider loops.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::response::Html;
use axum::routing::get;
use futures::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{Map, Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use tundra::config::MarketConfig;
use tundra::executor::{Execution, ExecutionAdapter, ExecutorRegistry};
use tundra::market::settlement::settle;
use tundra::market::{
    CycleOutcome, JobStatus, Marketplace, ProviderLoop, SettleOutcome, SubmitRequest, TaskType,
};
use tundra::registry::{self, Provider};
use tundra::router::KeywordRouter;
use tundra::store::{Database, LibSqlBackend};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const PAGE: &str = r#"<html><head><title>Tundra Test Page</title></head>
<body><p>Fresh snow.</p><a href="/one">one</a><a href="/two">two</a></body></html>"#;

/// Serve a small HTML page on a random port, return its base URL.
async fn start_page_server() -> String {
    let app = Router::new().route("/page", get(|| async { Html(PAGE) }));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("http://127.0.0.1:{port}")
}

async fn setup(seed: bool) -> (Arc<dyn Database>, Marketplace) {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    if seed {
        registry::seed(&db).await.unwrap();
    }
    let config = MarketConfig {
        starting_balance: dec!(100),
        ..MarketConfig::default()
    };
    let market = Marketplace::new(Arc::clone(&db), Arc::new(KeywordRouter), &config);
    (db, market)
}

fn adapter() -> ExecutionAdapter {
    let executors = Arc::new(ExecutorRegistry::with_builtins(Duration::from_secs(5)));
    ExecutionAdapter::new(executors, Duration::from_secs(5))
}

fn provider_loop(db: &Arc<dyn Database>, id: &str) -> ProviderLoop {
    ProviderLoop::new(id, Arc::clone(db), adapter())
}

fn request(task_type: &str, goal: &str, payload: Value, budget: Decimal) -> SubmitRequest {
    let payload: Map<String, Value> = match payload {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    SubmitRequest {
        requester_id: "alice".into(),
        task_type: Some(task_type.into()),
        goal: goal.into(),
        payload,
        budget,
    }
}

#[tokio::test]
async fn web_scrape_job_completes_and_pays_the_rate() {
    timeout(TEST_TIMEOUT, async {
        let base = start_page_server().await;
        let (db, market) = setup(true).await;

        let receipt = market
            .submit(request(
                "web_scrape",
                "grab the page",
                json!({"url": format!("{base}/page")}),
                dec!(15),
            ))
            .await
            .unwrap();
        assert_eq!(receipt.eligible_agents, vec!["A1".to_string()]);

        let outcome = provider_loop(&db, "A1").run_cycle().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Settled {
                job_id: receipt.job_id,
                outcome: SettleOutcome::Completed {
                    transferred: dec!(15)
                },
            }
        );

        let job = market.get(receipt.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.provider_id.as_deref(), Some("A1"));
        let result = job.result.unwrap();
        assert_eq!(result["title"], "Tundra Test Page");
        assert!(!job.events.is_empty());

        let statuses: Vec<JobStatus> = job.status_history.iter().map(|c| c.status).collect();
        assert_eq!(
            statuses,
            vec![
                JobStatus::Open,
                JobStatus::Claimed,
                JobStatus::InProgress,
                JobStatus::Completed
            ]
        );

        let ledger = market.ledger();
        assert_eq!(ledger.balance("alice").await.unwrap(), dec!(85));
        assert_eq!(ledger.balance("A1").await.unwrap(), dec!(15));
        assert_eq!(ledger.total().await.unwrap(), dec!(100));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn budget_below_every_rate_stays_open() {
    timeout(TEST_TIMEOUT, async {
        let (db, market) = setup(true).await;
        let receipt = market
            .submit(request(
                "web_scrape",
                "too cheap",
                json!({"url": "http://127.0.0.1:1/page"}),
                dec!(3),
            ))
            .await
            .unwrap();
        assert!(receipt.eligible_agents.is_empty());
        assert_eq!(receipt.status, JobStatus::Open);

        assert_eq!(provider_loop(&db, "A1").run_cycle().await.unwrap(), CycleOutcome::Idle);
        let job = market.get(receipt.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Open);
        assert!(job.provider_id.is_none());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn many_providers_race_for_one_job() {
    timeout(TEST_TIMEOUT, async {
        let (db, market) = setup(false).await;
        let ids: Vec<String> = (1..=8).map(|i| format!("G{i}")).collect();
        for id in &ids {
            db.upsert_provider(&Provider::new(id.as_str(), id.as_str(), vec![TaskType::Generic], dec!(1)))
                .await
                .unwrap();
        }

        let receipt = market
            .submit(request("generic", "only one of you", json!({}), dec!(5)))
            .await
            .unwrap();
        assert_eq!(receipt.eligible_agents.len(), ids.len());

        let loops: Vec<ProviderLoop> = ids.iter().map(|id| provider_loop(&db, id)).collect();
        let outcomes = join_all(loops.iter().map(|l| l.run_cycle())).await;

        let settled: Vec<&CycleOutcome> = outcomes
            .iter()
            .map(|o| o.as_ref().unwrap())
            .filter(|o| matches!(o, CycleOutcome::Settled { .. }))
            .collect();
        assert_eq!(settled.len(), 1);
        for outcome in outcomes.iter().map(|o| o.as_ref().unwrap()) {
            assert!(matches!(
                outcome,
                CycleOutcome::Settled { .. } | CycleOutcome::LostRace { .. } | CycleOutcome::Idle
            ));
        }

        let job = market.get(receipt.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        let claims = job
            .status_history
            .iter()
            .filter(|c| c.status == JobStatus::Claimed)
            .count();
        assert_eq!(claims, 1);

        let winner = job.provider_id.unwrap();
        let ledger = market.ledger();
        assert_eq!(ledger.balance(&winner).await.unwrap(), dec!(5));
        assert_eq!(ledger.total().await.unwrap(), dec!(100));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn single_provider_takes_jobs_oldest_first() {
    timeout(TEST_TIMEOUT, async {
        let (db, market) = setup(true).await;
        let mut submitted = Vec::new();
        for goal in ["first", "second", "third"] {
            let receipt = market
                .submit(request("generic", goal, json!({}), dec!(12)))
                .await
                .unwrap();
            submitted.push(receipt.job_id);
        }

        let a3 = provider_loop(&db, "A3");
        let mut order = Vec::new();
        for _ in 0..3 {
            match a3.run_cycle().await.unwrap() {
                CycleOutcome::Settled { job_id, .. } => order.push(job_id),
                other => panic!("unexpected cycle outcome: {other:?}"),
            }
        }
        assert_eq!(order, submitted);
        assert_eq!(a3.run_cycle().await.unwrap(), CycleOutcome::Idle);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn eligibility_snapshot_ignores_later_providers() {
    timeout(TEST_TIMEOUT, async {
        let (db, market) = setup(true).await;
        let receipt = market
            .submit(request("generic", "frozen", json!({}), dec!(12)))
            .await
            .unwrap();
        assert_eq!(receipt.eligible_agents, vec!["A3".to_string()]);

        db.upsert_provider(&Provider::new("Z9", "Latecomer", vec![TaskType::Generic], dec!(1)))
            .await
            .unwrap();

        assert_eq!(provider_loop(&db, "Z9").run_cycle().await.unwrap(), CycleOutcome::Idle);
        let job = market.get(receipt.job_id).await.unwrap();
        assert_eq!(job.eligible_agents, vec!["A3".to_string()]);
        assert_eq!(job.status, JobStatus::Open);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn second_settlement_changes_nothing() {
    timeout(TEST_TIMEOUT, async {
        let (db, market) = setup(true).await;
        let receipt = market
            .submit(request("generic", "settle me", json!({}), dec!(12)))
            .await
            .unwrap();
        provider_loop(&db, "A3").run_cycle().await.unwrap();

        let job = market.get(receipt.job_id).await.unwrap();
        let again = settle(
            db.as_ref(),
            &job,
            "A3",
            Execution {
                outcome: Ok(json!({"late": true})),
                events: Vec::new(),
            },
        )
        .await
        .unwrap();
        assert_eq!(
            again,
            SettleOutcome::AlreadySettled {
                status: JobStatus::Completed
            }
        );

        let after = market.get(receipt.job_id).await.unwrap();
        assert_eq!(after.result, job.result);
        assert_eq!(after.status_history.len(), job.status_history.len());
        let ledger = market.ledger();
        assert_eq!(ledger.balance("alice").await.unwrap(), dec!(88));
        assert_eq!(ledger.balance("A3").await.unwrap(), dec!(12));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn failed_execution_leaves_ledger_untouched() {
    timeout(TEST_TIMEOUT, async {
        let base = start_page_server().await;
        let (db, market) = setup(true).await;
        let receipt = market
            .submit(request(
                "web_scrape",
                "missing page",
                json!({"url": format!("{base}/missing")}),
                dec!(20),
            ))
            .await
            .unwrap();

        let outcome = provider_loop(&db, "A1").run_cycle().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Settled {
                job_id: receipt.job_id,
                outcome: SettleOutcome::Failed
            }
        );

        let job = market.get(receipt.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.unwrap()["kind"], "network");
        assert!(job.result.is_none());

        let ledger = market.ledger();
        assert_eq!(ledger.balance("alice").await.unwrap(), dec!(100));
        assert_eq!(ledger.balance("A1").await.unwrap(), Decimal::ZERO);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn credits_are_conserved_across_mixed_outcomes() {
    timeout(TEST_TIMEOUT, async {
        let base = start_page_server().await;
        let (db, market) = setup(true).await;

        market
            .submit(request("web_scrape", "ok", json!({"url": format!("{base}/page")}), dec!(15)))
            .await
            .unwrap();
        market
            .submit(request("web_scrape", "bad", json!({"url": format!("{base}/missing")}), dec!(16)))
            .await
            .unwrap();
        market
            .submit(request("generic", "fine", json!({}), dec!(12)))
            .await
            .unwrap();
        market
            .submit(request(
                "summarize",
                "short",
                json!({"text": "One sentence. Two sentences. Three."}),
                dec!(9),
            ))
            .await
            .unwrap();

        let loops = ["A1", "A2", "A3", "A4"].map(|id| provider_loop(&db, id));
        for _ in 0..3 {
            join_all(loops.iter().map(|l| l.run_cycle())).await;
        }

        let completed = market
            .list(Some(JobStatus::Completed), None, None)
            .await
            .unwrap();
        let failed = market.list(Some(JobStatus::Failed), None, None).await.unwrap();
        assert_eq!(completed.total, 3);
        assert_eq!(failed.total, 1);

        let ledger = market.ledger();
        assert_eq!(ledger.total().await.unwrap(), dec!(100));
        assert_eq!(ledger.balance("alice").await.unwrap(), dec!(64));
    })
    .await
    .expect("test timed out");
}

/// Spawn one task per provider loop, each cycling until it finds no work.
async fn drain_on_tasks(loops: Vec<ProviderLoop>) -> Vec<CycleOutcome> {
    let handles: Vec<_> = loops
        .into_iter()
        .map(|l| {
            tokio::spawn(async move {
                let mut outcomes = Vec::new();
                loop {
                    match l.run_cycle().await.unwrap() {
                        CycleOutcome::Idle => break,
                        outcome => outcomes.push(outcome),
                    }
                }
                outcomes
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    all
}

async fn generic_providers(db: &Arc<dyn Database>, count: usize) -> Vec<String> {
    let ids: Vec<String> = (1..=count).map(|i| format!("G{i}")).collect();
    for id in &ids {
        db.upsert_provider(&Provider::new(id.as_str(), id.as_str(), vec![TaskType::Generic], dec!(1)))
            .await
            .unwrap();
    }
    ids
}

fn settled_count(outcomes: &[CycleOutcome]) -> usize {
    outcomes
        .iter()
        .filter(|o| matches!(o, CycleOutcome::Settled { .. }))
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn spawned_providers_settle_each_job_once() {
    timeout(TEST_TIMEOUT, async {
        let (db, market) = setup(false).await;
        let ids = generic_providers(&db, 8).await;

        let mut jobs = Vec::new();
        for i in 0..6 {
            let receipt = market
                .submit(request("generic", &format!("job {i}"), json!({}), dec!(5)))
                .await
                .unwrap();
            jobs.push(receipt.job_id);
        }

        let loops = ids.iter().map(|id| provider_loop(&db, id)).collect();
        let outcomes = drain_on_tasks(loops).await;
        assert_eq!(settled_count(&outcomes), jobs.len());
        assert!(outcomes.iter().all(|o| matches!(
            o,
            CycleOutcome::Settled { .. } | CycleOutcome::LostRace { .. }
        )));

        for id in jobs {
            let job = market.get(id).await.unwrap();
            assert_eq!(job.status, JobStatus::Completed);
            let claims = job
                .status_history
                .iter()
                .filter(|c| c.status == JobStatus::Claimed)
                .count();
            assert_eq!(claims, 1);
        }
        assert_eq!(market.ledger().total().await.unwrap(), dec!(100));
        assert_eq!(market.ledger().balance("alice").await.unwrap(), dec!(70));
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn providers_on_separate_connections_settle_each_job_once() {
    timeout(TEST_TIMEOUT, async {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("market.db");
        let first: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
        let second: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
        let ids = generic_providers(&first, 6).await;

        let config = MarketConfig {
            starting_balance: dec!(100),
            ..MarketConfig::default()
        };
        let market = Marketplace::new(Arc::clone(&first), Arc::new(KeywordRouter), &config);
        let mut jobs = Vec::new();
        for i in 0..5 {
            let receipt = market
                .submit(request("generic", &format!("job {i}"), json!({}), dec!(4)))
                .await
                .unwrap();
            jobs.push(receipt.job_id);
        }

        let loops = ids
            .iter()
            .enumerate()
            .map(|(i, id)| provider_loop(if i % 2 == 0 { &first } else { &second }, id))
            .collect();
        let outcomes = drain_on_tasks(loops).await;
        assert_eq!(settled_count(&outcomes), jobs.len());

        for id in jobs {
            let job = second.get_job(id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Completed);
        }
        assert_eq!(market.ledger().total().await.unwrap(), dec!(100));
        assert_eq!(market.ledger().balance("alice").await.unwrap(), dec!(80));
    })
    .await
    .expect("test timed out");
}
