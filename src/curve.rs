// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Fan curve evaluation.
//!
//! A curve maps the moving average of one or more temperature sensors
//! to a PWM duty value (0-255). Linear curves interpolate a window or
//! an explicit step table, PID curves hold a setpoint, and function
//! curves combine the outputs of other curves. Curves form a DAG over
//! sensors and other curves; cycles are rejected at startup.

use crate::config::{CurveConfig, CurveFunction, CurveKind, CurveStep};
use crate::error::{Error, Result};
use crate::sensor::Sensor;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// All configured curves, keyed by id, validated and ready to evaluate.
#[derive(Debug)]
pub struct CurveRegistry {
    curves: HashMap<String, Curve>,
}

#[derive(Debug)]
struct Curve {
    behavior: Behavior,
}

#[derive(Debug)]
enum Behavior {
    LinearWindow {
        sensor: Arc<Sensor>,
        min_temp: f64,
        max_temp: f64,
    },
    LinearSteps {
        sensor: Arc<Sensor>,
        /// Sorted by temperature, strictly increasing.
        steps: Vec<CurveStep>,
    },
    Pid {
        sensor: Arc<Sensor>,
        p: f64,
        i: f64,
        d: f64,
        setpoint: f64,
        integral_limit: f64,
        state: Mutex<PidState>,
    },
    Function {
        function: CurveFunction,
        members: Vec<String>,
    },
}

#[derive(Debug, Default)]
struct PidState {
    integral: f64,
    last_error: f64,
}

impl CurveRegistry {
    /// Build and validate the registry: every referenced sensor and
    /// curve must exist and the dependency graph must be acyclic.
    pub fn build(
        configs: &[CurveConfig],
        sensors: &HashMap<String, Arc<Sensor>>,
    ) -> Result<Self> {
        let mut curves = HashMap::new();

        for config in configs {
            let behavior = Self::build_behavior(config, sensors)?;
            if curves
                .insert(config.id.clone(), Curve { behavior })
                .is_some()
            {
                return Err(Error::config(format!("duplicate curve id {:?}", config.id)));
            }
        }

        let registry = Self { curves };
        registry.validate_graph()?;
        Ok(registry)
    }

    fn build_behavior(
        config: &CurveConfig,
        sensors: &HashMap<String, Arc<Sensor>>,
    ) -> Result<Behavior> {
        let lookup_sensor = |id: &str| -> Result<Arc<Sensor>> {
            sensors.get(id).cloned().ok_or_else(|| {
                Error::config(format!(
                    "curve {:?} references unknown sensor {id:?}",
                    config.id
                ))
            })
        };

        match &config.kind {
            CurveKind::Linear {
                sensor,
                min_temp,
                max_temp,
                steps,
            } => {
                let sensor = lookup_sensor(sensor)?;
                if let Some(steps) = steps {
                    let mut steps = steps.clone();
                    steps.sort_by_key(|s| s.temp);
                    if steps.is_empty() {
                        return Err(Error::config(format!(
                            "curve {:?} has an empty step table",
                            config.id
                        )));
                    }
                    if steps.windows(2).any(|w| w[0].temp == w[1].temp) {
                        return Err(Error::config(format!(
                            "curve {:?} repeats a step temperature",
                            config.id
                        )));
                    }
                    Ok(Behavior::LinearSteps { sensor, steps })
                } else {
                    match (min_temp, max_temp) {
                        (Some(min), Some(max)) if min < max => Ok(Behavior::LinearWindow {
                            sensor,
                            min_temp: *min as f64,
                            max_temp: *max as f64,
                        }),
                        _ => Err(Error::config(format!(
                            "curve {:?} needs either steps or min_temp < max_temp",
                            config.id
                        ))),
                    }
                }
            }

            CurveKind::Pid {
                sensor,
                p,
                i,
                d,
                setpoint,
            } => {
                // cap the integral so its term alone cannot exceed full duty
                let integral_limit = if i.abs() > f64::EPSILON {
                    255.0 / i.abs()
                } else {
                    0.0
                };
                Ok(Behavior::Pid {
                    sensor: lookup_sensor(sensor)?,
                    p: *p,
                    i: *i,
                    d: *d,
                    setpoint: *setpoint as f64,
                    integral_limit,
                    state: Mutex::new(PidState::default()),
                })
            }

            CurveKind::Function { function, curves } => {
                if curves.is_empty() {
                    return Err(Error::config(format!(
                        "function curve {:?} has no members",
                        config.id
                    )));
                }
                Ok(Behavior::Function {
                    function: *function,
                    members: curves.clone(),
                })
            }
        }
    }

    /// Check that every curve-to-curve reference resolves and that the
    /// dependency graph has no cycle.
    fn validate_graph(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            InProgress,
            Done,
        }

        fn visit(
            registry: &CurveRegistry,
            id: &str,
            marks: &mut HashMap<String, Mark>,
        ) -> Result<()> {
            match marks.get(id) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::InProgress) => {
                    return Err(Error::config(format!(
                        "curve dependency cycle involving {id:?}"
                    )))
                }
                None => {}
            }
            marks.insert(id.to_string(), Mark::InProgress);

            if let Behavior::Function { members, .. } = &registry.curves[id].behavior {
                for member in members {
                    if !registry.curves.contains_key(member) {
                        return Err(Error::config(format!(
                            "curve {id:?} references unknown curve {member:?}"
                        )));
                    }
                    visit(registry, member, marks)?;
                }
            }

            marks.insert(id.to_string(), Mark::Done);
            Ok(())
        }

        let mut marks = HashMap::new();
        for id in self.curves.keys() {
            visit(self, id, &mut marks)?;
        }
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.curves.contains_key(id)
    }

    /// Evaluate a curve to a target PWM.
    pub fn evaluate(&self, id: &str) -> Result<u8> {
        let curve = self
            .curves
            .get(id)
            .ok_or_else(|| Error::config(format!("unknown curve {id:?}")))?;
        curve.evaluate(self)
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

impl Curve {
    fn evaluate(&self, registry: &CurveRegistry) -> Result<u8> {
        match &self.behavior {
            Behavior::LinearWindow {
                sensor,
                min_temp,
                max_temp,
            } => {
                let t = sensor.moving_avg();
                let ratio = (t - min_temp) / (max_temp - min_temp);
                Ok((ratio * 255.0).round().clamp(0.0, 255.0) as u8)
            }

            Behavior::LinearSteps { sensor, steps } => {
                Ok(interpolate_steps(steps, sensor.moving_avg()))
            }

            Behavior::Pid {
                sensor,
                p,
                i,
                d,
                setpoint,
                integral_limit,
                state,
            } => {
                let error = setpoint - sensor.moving_avg();
                let mut state = state.lock().unwrap();
                state.integral =
                    (state.integral + error).clamp(-integral_limit, *integral_limit);
                let derivative = error - state.last_error;
                state.last_error = error;

                let output = p * error + i * state.integral + d * derivative;
                Ok(output.round().clamp(0.0, 255.0) as u8)
            }

            Behavior::Function { function, members } => {
                let mut outputs = Vec::with_capacity(members.len());
                for member in members {
                    outputs.push(registry.evaluate(member)?);
                }
                let min = *outputs.iter().min().unwrap();
                let max = *outputs.iter().max().unwrap();
                Ok(match function {
                    CurveFunction::Min => min,
                    CurveFunction::Max => max,
                    CurveFunction::Delta => max - min,
                    CurveFunction::Average => {
                        let sum: u32 = outputs.iter().map(|&v| v as u32).sum();
                        (sum as f64 / outputs.len() as f64).round() as u8
                    }
                })
            }
        }
    }
}

/// Interpolate a sorted step table at temperature `t` (millidegrees).
///
/// - Below the lowest point: the lowest point's PWM
/// - Above the highest point: the highest point's PWM
/// - Between two points: linear interpolation
fn interpolate_steps(steps: &[CurveStep], t: f64) -> u8 {
    let first = &steps[0];
    if steps.len() == 1 || t <= first.temp as f64 {
        return first.pwm;
    }

    let last = &steps[steps.len() - 1];
    if t >= last.temp as f64 {
        return last.pwm;
    }

    for window in steps.windows(2) {
        let (lo, hi) = (&window[0], &window[1]);
        if t >= lo.temp as f64 && t <= hi.temp as f64 {
            let frac = (t - lo.temp as f64) / (hi.temp - lo.temp) as f64;
            let pwm = lo.pwm as f64 + frac * (hi.pwm as f64 - lo.pwm as f64);
            return pwm.round().clamp(0.0, 255.0) as u8;
        }
    }

    last.pwm
}
