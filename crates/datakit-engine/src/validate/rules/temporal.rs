use datakit_types::episode::Episode;

use crate::validate::{Hit, RuleContext};

pub fn monotonic(episode: &Episode, _ctx: &RuleContext<'_>) -> Vec<Hit> {
    let offenders: Vec<usize> = episode
        .steps
        .windows(2)
        .enumerate()
        .filter(|(_, pair)| pair[1].timestamp <= pair[0].timestamp)
        .map(|(i, _)| i + 1)
        .collect();
    match offenders.first() {
        Some(&step) => vec![Hit::step(
            step,
            format!("{} timestamp(s) do not increase", offenders.len()),
        )
        .field("timestamp")
        .value(episode.steps[step].timestamp)],
        None => Vec::new(),
    }
}

pub fn gaps(episode: &Episode, ctx: &RuleContext<'_>) -> Vec<Hit> {
    if ctx.spec.control_rate_hz <= 0.0 {
        return Vec::new();
    }
    let limit = ctx.config.timestamp_gap_factor / ctx.spec.control_rate_hz;
    let widest = episode
        .steps
        .windows(2)
        .enumerate()
        .map(|(i, pair)| (i + 1, pair[1].timestamp - pair[0].timestamp))
        .filter(|(_, dt)| *dt > limit)
        .max_by(|a, b| a.1.total_cmp(&b.1));
    match widest {
        Some((step, dt)) => vec![Hit::step(
            step,
            format!("timestamp gap {dt:.4}s exceeds {limit:.4}s"),
        )
        .field("timestamp")
        .value(dt)],
        None => Vec::new(),
    }
}

pub fn origin(episode: &Episode, _ctx: &RuleContext<'_>) -> Vec<Hit> {
    match episode.steps.first() {
        Some(step) if step.timestamp != 0.0 => vec![Hit::step(
            0,
            format!("first timestamp is {}", step.timestamp),
        )
        .field("timestamp")
        .value(step.timestamp)],
        _ => Vec::new(),
    }
}
