use datakit_types::episode::Episode;

use super::{ParamReader, Params, Transform, TransformContext, TransformError};

pub const TIMESTAMP_CANONICALIZE: &str = "timestamp_canonicalize";

/// Makes timestamps strictly increasing.
///
/// When every timestamp is zero (the source had none) or `force` is set,
/// timestamps are synthesised as `i / rate`. Otherwise non-finite values are
/// replaced and any step that does not advance is pushed to `prev + 1/rate`.
#[derive(Debug, Clone)]
pub struct TimestampCanonicalize {
    control_rate_hz: Option<f64>,
    force: bool,
}

impl TimestampCanonicalize {
    /// # Errors
    ///
    /// `control_rate_hz`, when set, must be positive.
    pub fn build(params: &Params) -> Result<Box<dyn Transform>, TransformError> {
        let reader = ParamReader::new(TIMESTAMP_CANONICALIZE, params, &["control_rate_hz", "force"])?;
        let control_rate_hz = reader.number("control_rate_hz")?;
        if control_rate_hz.is_some_and(|rate| rate <= 0.0 || !rate.is_finite()) {
            return Err(reader.invalid("control_rate_hz", "must be a positive number"));
        }
        Ok(Box::new(Self {
            control_rate_hz,
            force: reader.boolean("force", false)?,
        }))
    }
}

impl Transform for TimestampCanonicalize {
    fn name(&self) -> &'static str {
        TIMESTAMP_CANONICALIZE
    }

    fn apply(&self, mut episode: Episode, ctx: &TransformContext<'_>) -> Result<Episode, TransformError> {
        let rate = self
            .control_rate_hz
            .or(Some(ctx.spec.control_rate_hz).filter(|r| *r > 0.0))
            .unwrap_or(10.0);
        let dt = 1.0 / rate;
        let missing = episode.steps.len() > 1 && episode.steps.iter().all(|s| s.timestamp == 0.0);

        let mut prev: Option<f64> = None;
        for (i, step) in episode.steps.iter_mut().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            let synthetic = i as f64 * dt;
            if self.force || missing || !step.timestamp.is_finite() {
                step.timestamp = synthetic;
            }
            if let Some(p) = prev {
                if step.timestamp <= p {
                    step.timestamp = p + dt;
                }
            }
            prev = Some(step.timestamp);
        }
        Ok(episode)
    }
}
