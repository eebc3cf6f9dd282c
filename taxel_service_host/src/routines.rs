//! Built-in routines the host can attach to a manifest entry.

use taxel::record::TaxelSample;
use taxel_services::{ServiceClient, ServiceError, ServiceResult, ServiceRoutine, Substrate};

use crate::config::{RoutineKind, ServiceConfig};

/// Build the routine for one manifest entry.
///
/// Amplifiers connect to their source buffer here, so a missing source
/// fails registration rather than the first invocation.
pub fn build(substrate: &Substrate, config: &ServiceConfig) -> ServiceResult<ServiceRoutine> {
    match config.routine {
        RoutineKind::Generate => Ok(generate(config.element_count)),
        RoutineKind::Amplify => {
            let source = config
                .source
                .as_deref()
                .ok_or_else(|| ServiceError::InvalidDescriptor {
                    reason: format!("service '{}': amplify requires a source", config.name),
                })?;
            let client = ServiceClient::connect(substrate, source)?;
            Ok(amplify(client, config.element_count, config.gain))
        }
    }
}

/// Synthesize a travelling wave across the taxel grid.
///
/// Stands in for real sensor acquisition so the pipeline can be run
/// without hardware.
fn generate(count: usize) -> ServiceRoutine {
    let mut phase: f32 = 0.0;
    Box::new(move |buffer| {
        for i in 0..count {
            let x = (i % 8) as f32 * 0.01;
            let y = (i / 8) as f32 * 0.01;
            buffer.element::<TaxelSample>(i)?.set(TaxelSample {
                position: [x, y, 0.0],
                response: ((phase + i as f32 * 0.4).sin() + 1.0) * 0.5,
            });
        }
        phase += 0.1;
        Ok(())
    })
}

/// Copy samples from `source`, scaling each response by `gain`.
fn amplify(source: ServiceClient, count: usize, gain: f32) -> ServiceRoutine {
    Box::new(move |buffer| {
        let samples = source.snapshot::<TaxelSample>()?;
        for (i, sample) in samples.iter().take(count).enumerate() {
            buffer.element::<TaxelSample>(i)?.set(TaxelSample {
                position: sample.position,
                response: sample.response * gain,
            });
        }
        Ok(())
    })
}
