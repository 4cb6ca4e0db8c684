use aigate_common::{GateError, Outcome};
use aigate_optimizer::OptimizationStats;
use aigate_scheduler::QueueStats;

pub fn print_outcome(prompt: &str, outcome: &Outcome, json: bool) {
    if json {
        let line = match outcome {
            Ok(resp) => serde_json::to_string(resp),
            Err(err) => serde_json::to_string(&serde_json::json!({
                "prompt": prompt,
                "error": err.to_string(),
                "kind": err.kind(),
            })),
        };
        match line {
            Ok(line) => println!("{line}"),
            Err(err) => eprintln!("✗ failed to encode output: {err}"),
        }
        return;
    }

    match outcome {
        Ok(resp) => {
            let source = if resp.cached {
                "cache"
            } else if resp.deduplicated {
                "dedup"
            } else {
                "provider"
            };
            println!(
                "✓ {} [{}] {}ms, {} tokens, ${:.6}",
                resp.id,
                source,
                resp.duration_ms,
                resp.total_tokens(),
                resp.cost
            );
            println!("  {}", resp.content);
        }
        Err(err) => print_error(prompt, err),
    }
}

fn print_error(prompt: &str, err: &GateError) {
    eprintln!("✗ {prompt:?} failed ({}): {err}", err.kind());
}

pub fn print_queue_stats(stats: &QueueStats) {
    println!("\n=== Admission Queue ===");
    println!(
        "  {:<10} {:<10} {:<10} {:<10}",
        "High", "Normal", "Low", "In-flight"
    );
    println!(
        "  {:<10} {:<10} {:<10} {:<10}",
        stats.pending_high, stats.pending_normal, stats.pending_low, stats.in_flight
    );
    println!();
    println!("  {:<20} {}", "Enqueued", stats.enqueued);
    println!("  {:<20} {}", "Completed", stats.completed);
    println!("  {:<20} {}", "Failed", stats.failed);
    println!("  {:<20} {}", "Timed out", stats.timed_out);
    println!("  {:<20} {}", "Rate-limited defers", stats.rate_limited);
    println!("  {:<20} {:.1}ms", "Avg wait", stats.avg_wait_ms);
    println!("  {:<20} {:.1}ms", "Avg processing", stats.avg_processing_ms);
}

pub fn print_optimization_stats(stats: &OptimizationStats) {
    println!("\n=== Optimization ===");
    println!("  {:<20} {}", "Requests", stats.total);
    println!(
        "  {:<20} {} ({:.1}%)",
        "Cache hits",
        stats.cached,
        stats.cache_hit_rate * 100.0
    );
    println!(
        "  {:<20} {} ({:.1}%)",
        "Dedup joins",
        stats.deduplicated,
        stats.dedup_rate * 100.0
    );
    println!("  {:<20} {}", "Cache errors", stats.cache_errors);
    println!("  {:<20} {}", "Tokens saved", stats.tokens_saved);
    println!("  {:<20} ${:.6}", "Cost saved", stats.cost_saved);
    println!("  {:<20} {}", "Pending executions", stats.pending_executions);
    println!();
}
