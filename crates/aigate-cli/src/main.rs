mod args;
mod executor;
mod output;

use std::sync::Arc;
use std::time::{Duration, Instant};

use aigate_cache::{CacheStore, EtcdCacheStore, MemoryCacheStore};
use aigate_common::telemetry::init_tracing;
use aigate_common::{Executor, Priority, Request};
use aigate_optimizer::Optimizer;
use anyhow::Result;
use clap::Parser;
use futures_util::future::join_all;

use crate::args::{Args, Command, ExecutorKind};
use crate::executor::{OpenAiExecutor, StubExecutor};
use crate::output::{print_optimization_stats, print_outcome, print_queue_stats};

fn build_executor(args: &Args) -> Result<Arc<dyn Executor>> {
    Ok(match args.executor {
        ExecutorKind::Stub => Arc::new(StubExecutor::new(Duration::from_millis(args.stub_latency_ms))),
        ExecutorKind::Openai => Arc::new(OpenAiExecutor::new(
            args.openai_base_url.clone(),
            args.openai_api_key.clone(),
        )?),
    })
}

async fn build_store(args: &Args) -> Result<Arc<dyn CacheStore>> {
    if args.etcd_endpoints.is_empty() {
        return Ok(Arc::new(MemoryCacheStore::new()));
    }
    Ok(Arc::new(EtcdCacheStore::connect(&args.etcd_endpoints).await?))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let otel = init_tracing(
        "aigate-cli",
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
        args.log_format,
    );

    let config = args.engine_config();
    if let Command::Config = args.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let executor = build_executor(&args)?;
    let store = build_store(&args).await?;
    let optimizer = Optimizer::new(config, store);

    match &args.command {
        Command::Run {
            prompts,
            target,
            system,
            max_tokens,
            temperature,
            priority,
            no_cache,
            json,
        } => {
            let submissions = prompts.iter().map(|prompt| {
                let mut req = Request::new(&target.provider, &target.model, prompt)
                    .with_priority(*priority)
                    .with_cacheable(!*no_cache);
                if let Some(sys) = system {
                    req = req.with_system_prompt(sys);
                }
                if let Some(n) = max_tokens {
                    req = req.with_max_tokens(*n);
                }
                if let Some(t) = temperature {
                    req = req.with_temperature(*t);
                }
                let optimizer = optimizer.clone();
                let executor = executor.clone();
                async move { optimizer.submit(req, executor, None).await }
            });

            let outcomes = join_all(submissions).await;
            for (prompt, outcome) in prompts.iter().zip(&outcomes) {
                print_outcome(prompt, outcome, *json);
            }
            if !*json {
                print_queue_stats(&optimizer.queue_stats().await);
                print_optimization_stats(&optimizer.optimization_stats());
            }
        }
        Command::Bench {
            target,
            requests,
            unique,
            high_every,
            metrics,
        } => {
            let unique = (*unique).max(1);
            let started = Instant::now();
            let submissions = (0..*requests).map(|i| {
                let priority = if *high_every > 0 && i % *high_every == 0 {
                    Priority::High
                } else {
                    Priority::Normal
                };
                let req = Request::new(
                    &target.provider,
                    &target.model,
                    format!("benchmark prompt #{}", i % unique),
                )
                .with_priority(priority);
                let optimizer = optimizer.clone();
                let executor = executor.clone();
                async move { optimizer.submit(req, executor, None).await }
            });

            let outcomes = join_all(submissions).await;
            let failed = outcomes.iter().filter(|o| o.is_err()).count();
            tracing::info!(
                requests,
                failed,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "bench finished"
            );

            if *metrics {
                print!("{}", optimizer.render_metrics().await);
            } else {
                println!(
                    "\n{} requests in {:.2}s, {} failed",
                    requests,
                    started.elapsed().as_secs_f64(),
                    failed
                );
                print_queue_stats(&optimizer.queue_stats().await);
                print_optimization_stats(&optimizer.optimization_stats());
            }
        }
        Command::Config => {}
    }

    optimizer.shutdown().await;
    if let Some(provider) = otel {
        if let Err(err) = provider.shutdown() {
            tracing::warn!(error=%err, "failed to flush traces");
        }
    }
    Ok(())
}
