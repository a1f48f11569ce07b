use std::env;
use std::process::exit;
use std::sync::Arc;
use uuid::Uuid;

use skyflow::config::JobSpec;
use skyflow::context::RuntimeContext;
use skyflow::coordinator::{Coordinator, SubmitError};
use skyflow::ratelimit::RateLimitConfig;
use skyflow::retry::RetryConfig;
use skyflow::store::{JobFilter, StateStore, TaskStatus};
use skyflow::{PgStateStore, SystemClock};

// Exit codes: 0 ok, 2 invalid config, 3 job not found, 4 unknown handler,
// 5 storage unavailable, 1 anything else.
const EXIT_INVALID_CONFIG: i32 = 2;
const EXIT_JOB_NOT_FOUND: i32 = 3;
const EXIT_UNKNOWN_HANDLER: i32 = 4;
const EXIT_STORE_UNAVAILABLE: i32 = 5;

fn usage() -> ! {
    eprintln!(
        "skyflowctl <command>\n\
         Commands:\n\
         - submit --config <path>\n\
         - status --job <id>\n\
         - tasks  --job <id> [--status <s>]\n\
         - cancel --job <id>\n\
         - logs   --job <id> [--task <id>]\n\
         - jobs\n\
         \n\
         Uses SKYFLOW_DATABASE_URL or DATABASE_URL, and SKYFLOW_STORE_ROOT.\n"
    );
    exit(EXIT_INVALID_CONFIG);
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        usage();
    }

    let ctx = connect().await;

    match args[1].as_str() {
        "submit" => submit(&ctx, &args).await,
        "status" => status(&ctx, &args).await,
        "tasks" => tasks(&ctx, &args).await,
        "cancel" => cancel(&ctx, &args).await,
        "logs" => logs(&ctx, &args).await,
        "jobs" => jobs(&ctx).await,
        other => {
            eprintln!("Unknown command: {other}");
            usage();
        }
    }
}

async fn connect() -> RuntimeContext {
    dotenvy::dotenv().ok();
    let url = env::var("SKYFLOW_DATABASE_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .unwrap_or_else(|_| {
            eprintln!("SKYFLOW_DATABASE_URL or DATABASE_URL must be set");
            exit(EXIT_STORE_UNAVAILABLE);
        });
    let store_root =
        env::var("SKYFLOW_STORE_ROOT").unwrap_or_else(|_| "./skyflow-data".to_string());

    let pool = match skyflow::db::make_pool(&url).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("cannot reach store: {e}");
            exit(EXIT_STORE_UNAVAILABLE);
        }
    };

    RuntimeContext::new(
        Arc::new(PgStateStore::new(pool)),
        skyflow::artifact::ArtifactStore::new(store_root),
        Arc::new(skyflow::handlers::builtin_registry()),
        Arc::new(SystemClock),
        RateLimitConfig::atproto_default(),
        RetryConfig::default(),
    )
}

fn arg_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}

fn require_job_id(args: &[String]) -> Uuid {
    let Some(raw) = arg_value(args, "--job") else {
        eprintln!("--job <id> is required");
        exit(EXIT_INVALID_CONFIG);
    };
    match raw.parse() {
        Ok(id) => id,
        Err(_) => {
            eprintln!("bad job id: {raw}");
            exit(EXIT_INVALID_CONFIG);
        }
    }
}

fn store_fatal(e: impl std::fmt::Display) -> ! {
    eprintln!("store error: {e}");
    exit(EXIT_STORE_UNAVAILABLE);
}

async fn submit(ctx: &RuntimeContext, args: &[String]) {
    let Some(path) = arg_value(args, "--config") else {
        eprintln!("--config <path> is required");
        exit(EXIT_INVALID_CONFIG);
    };
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            eprintln!("cannot read {path}: {e}");
            exit(EXIT_INVALID_CONFIG);
        }
    };
    let spec = match JobSpec::from_json(&raw) {
        Ok(spec) => spec,
        Err(e) => {
            eprintln!("invalid config: {e}");
            exit(EXIT_INVALID_CONFIG);
        }
    };

    match Coordinator::submit(ctx, spec, &whoami()).await {
        Ok(job_id) => println!("{job_id}"),
        Err(SubmitError::InvalidConfig(e)) => {
            eprintln!("invalid config: {e}");
            exit(EXIT_INVALID_CONFIG);
        }
        Err(SubmitError::UnknownHandler(h)) => {
            eprintln!(
                "unknown handler {h}; registered: {}",
                ctx.registry.names().join(", ")
            );
            exit(EXIT_UNKNOWN_HANDLER);
        }
        Err(SubmitError::Partition(e)) => {
            eprintln!("partitioning failed: {e}");
            exit(EXIT_INVALID_CONFIG);
        }
        Err(SubmitError::Store(e)) => store_fatal(e),
    }
}

async fn status(ctx: &RuntimeContext, args: &[String]) {
    let job_id = require_job_id(args);
    let job = match ctx.store.get_job(job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            eprintln!("job {job_id} not found");
            exit(EXIT_JOB_NOT_FOUND);
        }
        Err(e) => store_fatal(e),
    };
    let counts = match ctx.store.count_tasks(job_id).await {
        Ok(counts) => counts,
        Err(e) => store_fatal(e),
    };

    println!(
        "JOB {} name={} handler={} status={} submitted_at={} orphans_reclaimed={}",
        job.id,
        job.name,
        job.handler_ref,
        job.status.as_str(),
        job.submitted_at.to_rfc3339(),
        job.orphans_reclaimed
    );
    if let Some(failure) = &job.failure {
        println!(
            "FAILURE phase={} retryable={} terminal={}",
            failure.phase_failed, failure.retryable_count, failure.terminal_count
        );
    }

    let mut by_status: Vec<_> = counts.by_status().into_iter().collect();
    by_status.sort_by_key(|(s, _)| s.as_str());
    for (status, n) in by_status {
        println!("  {:>18} {}", status.as_str(), n);
    }

    let mut by_phase: Vec<_> = counts.by_phase().into_iter().collect();
    by_phase.sort_by(|a, b| a.0.cmp(&b.0));
    for (phase, statuses) in by_phase {
        let mut parts: Vec<String> = statuses
            .into_iter()
            .map(|(s, n)| format!("{}={n}", s.as_str()))
            .collect();
        parts.sort();
        println!("  phase {phase}: {}", parts.join(" "));
    }
}

async fn tasks(ctx: &RuntimeContext, args: &[String]) {
    let job_id = require_job_id(args);
    let status = match arg_value(args, "--status") {
        Some(raw) => match TaskStatus::parse(raw) {
            Some(s) => Some(s),
            None => {
                eprintln!("bad status: {raw}");
                exit(EXIT_INVALID_CONFIG);
            }
        },
        None => None,
    };
    match ctx.store.get_job(job_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            eprintln!("job {job_id} not found");
            exit(EXIT_JOB_NOT_FOUND);
        }
        Err(e) => store_fatal(e),
    }

    let tasks = match ctx.store.list_tasks(job_id, status).await {
        Ok(tasks) => tasks,
        Err(e) => store_fatal(e),
    };
    for t in tasks {
        println!(
            "{} batch={} role={} phase={} attempt={} status={} owner={} error={}",
            t.id,
            t.batch_id,
            t.role.as_str(),
            t.phase,
            t.attempt,
            t.status.as_str(),
            t.lease_owner.as_deref().unwrap_or("-"),
            t.error
                .as_ref()
                .map(|e| format!("{}:{}", e.kind, e.message))
                .unwrap_or_else(|| "-".to_string()),
        );
    }
}

async fn cancel(ctx: &RuntimeContext, args: &[String]) {
    let job_id = require_job_id(args);
    match ctx.store.get_job(job_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            eprintln!("job {job_id} not found");
            exit(EXIT_JOB_NOT_FOUND);
        }
        Err(e) => store_fatal(e),
    }
    match Coordinator::cancel(ctx, job_id).await {
        Ok(true) => println!("cancelled"),
        Ok(false) => println!("already terminal"),
        Err(e) => store_fatal(e),
    }
}

async fn logs(ctx: &RuntimeContext, args: &[String]) {
    let job_id = require_job_id(args);
    match ctx.store.get_job(job_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            eprintln!("job {job_id} not found");
            exit(EXIT_JOB_NOT_FOUND);
        }
        Err(e) => store_fatal(e),
    }

    let task_ids = match arg_value(args, "--task") {
        Some(raw) => match raw.parse::<Uuid>() {
            Ok(id) => vec![id],
            Err(_) => {
                eprintln!("bad task id: {raw}");
                exit(EXIT_INVALID_CONFIG);
            }
        },
        None => match ctx.artifacts.list_logged_tasks(job_id).await {
            Ok(ids) => ids,
            Err(e) => {
                eprintln!("cannot list logs: {e}");
                exit(1);
            }
        },
    };

    for task_id in task_ids {
        match ctx.artifacts.read_log(job_id, task_id).await {
            Ok(content) if content.is_empty() => {}
            Ok(content) => {
                println!("=== task {task_id} ===");
                print!("{content}");
            }
            Err(e) => {
                eprintln!("cannot read log for {task_id}: {e}");
                exit(1);
            }
        }
    }
}

async fn jobs(ctx: &RuntimeContext) {
    let jobs = match ctx.store.list_jobs(&JobFilter::default()).await {
        Ok(jobs) => jobs,
        Err(e) => store_fatal(e),
    };
    for job in jobs {
        println!(
            "{} name={} handler={} status={} submitted_at={}",
            job.id,
            job.name,
            job.handler_ref,
            job.status.as_str(),
            job.submitted_at.to_rfc3339()
        );
    }
}

fn whoami() -> String {
    env::var("USER")
        .or_else(|_| env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
