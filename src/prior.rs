//! Prior distributions and hierarchical prior resolution.
//!
//! A prior parameter is either a literal number or the name of another prior
//! in the same model. Priors are resolved in two phases: all priors with
//! literal parameters are drawn first, then every prior whose parameters
//! reference one of those is drawn with the referenced values substituted.

use std::f64::consts::PI;

use rand::Rng;
use rand_distr::{Beta, Cauchy, Distribution, Exp, Gamma, LogNormal, Normal, Uniform};
use serde::{Deserialize, Serialize};
use statrs::distribution::{self as stats, Continuous};

use crate::error::{AbcError, Result};

/// A distribution parameter: a literal value or the name of another prior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Literal(f64),
    Ref(String),
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Literal(value)
    }
}

impl From<&str> for ParamValue {
    fn from(name: &str) -> Self {
        ParamValue::Ref(name.to_string())
    }
}

/// Univariate distributions supported as priors.
///
/// The parameter type is [`ParamValue`] as configured, or `f64` once all
/// references have been substituted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dist", rename_all = "lowercase")]
pub enum Dist<P = ParamValue> {
    Normal { loc: P, scale: P },
    Cauchy { loc: P, scale: P },
    Uniform { low: P, high: P },
    Gamma { shape: P, scale: P },
    InvGamma { shape: P, scale: P },
    Beta { alpha: P, beta: P },
    Exponential { rate: P },
    LogNormal { mu: P, sigma: P },
    HalfNormal { scale: P },
    /// A fixed value, used for point-null hypotheses.
    Point { value: P },
}

impl<P> Dist<P> {
    fn try_map<Q, E>(
        &self,
        mut f: impl FnMut(&P) -> std::result::Result<Q, E>,
    ) -> std::result::Result<Dist<Q>, E> {
        Ok(match self {
            Dist::Normal { loc, scale } => Dist::Normal {
                loc: f(loc)?,
                scale: f(scale)?,
            },
            Dist::Cauchy { loc, scale } => Dist::Cauchy {
                loc: f(loc)?,
                scale: f(scale)?,
            },
            Dist::Uniform { low, high } => Dist::Uniform {
                low: f(low)?,
                high: f(high)?,
            },
            Dist::Gamma { shape, scale } => Dist::Gamma {
                shape: f(shape)?,
                scale: f(scale)?,
            },
            Dist::InvGamma { shape, scale } => Dist::InvGamma {
                shape: f(shape)?,
                scale: f(scale)?,
            },
            Dist::Beta { alpha, beta } => Dist::Beta {
                alpha: f(alpha)?,
                beta: f(beta)?,
            },
            Dist::Exponential { rate } => Dist::Exponential { rate: f(rate)? },
            Dist::LogNormal { mu, sigma } => Dist::LogNormal {
                mu: f(mu)?,
                sigma: f(sigma)?,
            },
            Dist::HalfNormal { scale } => Dist::HalfNormal { scale: f(scale)? },
            Dist::Point { value } => Dist::Point { value: f(value)? },
        })
    }

    fn params(&self) -> Vec<&P> {
        match self {
            Dist::Normal { loc: a, scale: b }
            | Dist::Cauchy { loc: a, scale: b }
            | Dist::Uniform { low: a, high: b }
            | Dist::Gamma { shape: a, scale: b }
            | Dist::InvGamma { shape: a, scale: b }
            | Dist::Beta { alpha: a, beta: b }
            | Dist::LogNormal { mu: a, sigma: b } => vec![a, b],
            Dist::Exponential { rate: a }
            | Dist::HalfNormal { scale: a }
            | Dist::Point { value: a } => vec![a],
        }
    }
}

impl Dist<f64> {
    fn check(&self) -> std::result::Result<(), String> {
        let positive = |what: &str, val: f64| {
            if val > 0. && val.is_finite() {
                Ok(())
            } else {
                Err(format!("{} must be positive and finite, got {}", what, val))
            }
        };
        let finite = |what: &str, val: f64| {
            if val.is_finite() {
                Ok(())
            } else {
                Err(format!("{} must be finite, got {}", what, val))
            }
        };
        match *self {
            Dist::Normal { loc, scale } | Dist::Cauchy { loc, scale } => {
                finite("loc", loc)?;
                positive("scale", scale)
            }
            Dist::Uniform { low, high } => {
                finite("low", low)?;
                finite("high", high)?;
                if low < high {
                    Ok(())
                } else {
                    Err(format!("low ({}) must be smaller than high ({})", low, high))
                }
            }
            Dist::Gamma { shape, scale } | Dist::InvGamma { shape, scale } => {
                positive("shape", shape)?;
                positive("scale", scale)
            }
            Dist::Beta { alpha, beta } => {
                positive("alpha", alpha)?;
                positive("beta", beta)
            }
            Dist::Exponential { rate } => positive("rate", rate),
            Dist::LogNormal { mu, sigma } => {
                finite("mu", mu)?;
                positive("sigma", sigma)
            }
            Dist::HalfNormal { scale } => positive("scale", scale),
            Dist::Point { value } => finite("value", value),
        }
    }

    /// Draw one value. Parameters must have passed validation.
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> std::result::Result<f64, String> {
        let value = match *self {
            Dist::Normal { loc, scale } => Normal::new(loc, scale)
                .map_err(|e| e.to_string())?
                .sample(rng),
            Dist::Cauchy { loc, scale } => Cauchy::new(loc, scale)
                .map_err(|e| e.to_string())?
                .sample(rng),
            Dist::Uniform { low, high } => Uniform::new(low, high)
                .map_err(|e| e.to_string())?
                .sample(rng),
            Dist::Gamma { shape, scale } => Gamma::new(shape, scale)
                .map_err(|e| e.to_string())?
                .sample(rng),
            Dist::InvGamma { shape, scale } => {
                let g: f64 = Gamma::new(shape, 1.)
                    .map_err(|e| e.to_string())?
                    .sample(rng);
                scale / g
            }
            Dist::Beta { alpha, beta } => Beta::new(alpha, beta)
                .map_err(|e| e.to_string())?
                .sample(rng),
            Dist::Exponential { rate } => Exp::new(rate).map_err(|e| e.to_string())?.sample(rng),
            Dist::LogNormal { mu, sigma } => LogNormal::new(mu, sigma)
                .map_err(|e| e.to_string())?
                .sample(rng),
            Dist::HalfNormal { scale } => Normal::new(0., scale)
                .map_err(|e| e.to_string())?
                .sample(rng)
                .abs(),
            Dist::Point { value } => value,
        };
        Ok(value)
    }

    /// Log density at `x`; `-inf` outside the support.
    pub fn ln_pdf(&self, x: f64) -> f64 {
        if x.is_nan() {
            return f64::NAN;
        }
        match *self {
            Dist::Normal { loc, scale } => ln_pdf_of(stats::Normal::new(loc, scale), x),
            Dist::Cauchy { loc, scale } => ln_pdf_of(stats::Cauchy::new(loc, scale), x),
            Dist::Uniform { low, high } => ln_pdf_of(stats::Uniform::new(low, high), x),
            Dist::Gamma { shape, scale } => {
                if x <= 0. {
                    return f64::NEG_INFINITY;
                }
                ln_pdf_of(stats::Gamma::new(shape, scale.recip()), x)
            }
            // the scale of an inverse gamma is the rate of the gamma it inverts
            Dist::InvGamma { shape, scale } => ln_pdf_of(stats::InverseGamma::new(shape, scale), x),
            Dist::Beta { alpha, beta } => {
                if x <= 0. || x >= 1. {
                    return f64::NEG_INFINITY;
                }
                ln_pdf_of(stats::Beta::new(alpha, beta), x)
            }
            Dist::Exponential { rate } => ln_pdf_of(stats::Exp::new(rate), x),
            Dist::LogNormal { mu, sigma } => ln_pdf_of(stats::LogNormal::new(mu, sigma), x),
            Dist::HalfNormal { scale } => {
                if x < 0. {
                    return f64::NEG_INFINITY;
                }
                let z = x / scale;
                0.5 * (2. / PI).ln() - scale.ln() - 0.5 * z * z
            }
            Dist::Point { value } => {
                if x == value {
                    0.
                } else {
                    f64::NEG_INFINITY
                }
            }
        }
    }
}

/// Parameters are validated before any density is evaluated, a failed
/// construction only shows up as NaN.
fn ln_pdf_of<D, E>(dist: std::result::Result<D, E>, x: f64) -> f64
where
    D: Continuous<f64, f64>,
{
    dist.map_or(f64::NAN, |dist| dist.ln_pdf(x))
}

/// A named prior as it appears in a model definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorSpec {
    pub name: String,
    #[serde(flatten)]
    pub dist: Dist,
}

impl PriorSpec {
    pub fn new(name: impl Into<String>, dist: Dist) -> Self {
        Self {
            name: name.into(),
            dist,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Literal(f64),
    Node(usize),
}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    dist: Dist<Slot>,
}

/// Resolved dependency structure of a model's priors.
///
/// Nodes keep the declaration order of the model; `order` holds the sampling
/// order (literal priors first, then derived priors).
#[derive(Debug, Clone)]
pub struct PriorGraph {
    nodes: Vec<Node>,
    order: Vec<usize>,
}

impl PriorGraph {
    pub fn new(specs: &[PriorSpec]) -> Result<Self> {
        let names: Vec<&str> = specs.iter().map(|spec| spec.name.as_str()).collect();
        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(AbcError::PriorResolution {
                    name: name.to_string(),
                    reason: "defined more than once".to_string(),
                });
            }
        }

        let nodes = specs
            .iter()
            .map(|spec| {
                let dist = spec.dist.try_map(|param| match param {
                    ParamValue::Literal(val) => Ok(Slot::Literal(*val)),
                    ParamValue::Ref(other) => names
                        .iter()
                        .position(|name| name == other)
                        .map(Slot::Node)
                        .ok_or_else(|| AbcError::PriorResolution {
                            name: spec.name.clone(),
                            reason: format!("references unknown prior '{}'", other),
                        }),
                })?;
                Ok(Node {
                    name: spec.name.clone(),
                    dist,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let deps = |node: &Node| -> Vec<usize> {
            node.dist
                .params()
                .into_iter()
                .filter_map(|slot| match slot {
                    Slot::Node(idx) => Some(*idx),
                    Slot::Literal(_) => None,
                })
                .collect()
        };

        let literal: Vec<bool> = nodes.iter().map(|node| deps(node).is_empty()).collect();

        if let Some(cycle) = find_cycle(&nodes, &deps) {
            return Err(AbcError::PriorResolution {
                name: nodes[cycle[0]].name.clone(),
                reason: format!(
                    "dependency cycle {}",
                    cycle
                        .iter()
                        .chain(std::iter::once(&cycle[0]))
                        .map(|&idx| nodes[idx].name.as_str())
                        .collect::<Vec<_>>()
                        .join(" -> ")
                ),
            });
        }

        for node in nodes.iter() {
            if let Some(&dep) = deps(node).iter().find(|&&dep| !literal[dep]) {
                return Err(AbcError::PriorResolution {
                    name: node.name.clone(),
                    reason: format!(
                        "depends on '{}', which is itself derived from another prior",
                        nodes[dep].name
                    ),
                });
            }
        }

        let order = (0..nodes.len())
            .filter(|&idx| literal[idx])
            .chain((0..nodes.len()).filter(|&idx| !literal[idx]))
            .collect();

        Ok(Self { nodes, order })
    }

    pub fn dim(&self) -> usize {
        self.nodes.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|node| node.name.as_str())
    }

    /// Which parameters are point masses and can not move.
    pub fn point_masses(&self) -> Vec<bool> {
        self.nodes
            .iter()
            .map(|node| matches!(node.dist, Dist::Point { .. }))
            .collect()
    }

    /// Names in the order they are drawn.
    pub fn sampling_order(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|&idx| self.nodes[idx].name.as_str())
    }

    fn resolve(&self, idx: usize, values: &[f64]) -> std::result::Result<Dist<f64>, String> {
        let dist = self.nodes[idx]
            .dist
            .try_map::<_, String>(|slot| match *slot {
                Slot::Literal(val) => Ok(val),
                Slot::Node(other) => Ok(values[other]),
            })?;
        dist.check()?;
        Ok(dist)
    }

    /// Draw one parameter vector in declaration order.
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Box<[f64]>> {
        let mut values = vec![f64::NAN; self.nodes.len()];
        for &idx in self.order.iter() {
            let invalid = |reason| AbcError::InvalidPriorParameter {
                name: self.nodes[idx].name.clone(),
                reason,
            };
            let dist = self.resolve(idx, &values).map_err(invalid)?;
            values[idx] = dist.sample(rng).map_err(invalid)?;
        }
        Ok(values.into())
    }

    /// Joint log density of a full parameter vector.
    ///
    /// References are resolved from `values` itself. Values that make a
    /// derived prior invalid (a negative scale, say) have density zero.
    pub fn log_density(&self, values: &[f64]) -> f64 {
        assert!(values.len() == self.nodes.len());
        self.order
            .iter()
            .map(|&idx| match self.resolve(idx, values) {
                Ok(dist) => dist.ln_pdf(values[idx]),
                Err(_) => f64::NEG_INFINITY,
            })
            .sum()
    }
}

fn find_cycle(nodes: &[Node], deps: &impl Fn(&Node) -> Vec<usize>) -> Option<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Active,
        Done,
    }

    fn visit(
        idx: usize,
        nodes: &[Node],
        deps: &impl Fn(&Node) -> Vec<usize>,
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        marks[idx] = Mark::Active;
        stack.push(idx);
        for dep in deps(&nodes[idx]) {
            match marks[dep] {
                Mark::Active => {
                    let start = stack.iter().position(|&x| x == dep).unwrap_or(0);
                    return Some(stack[start..].to_vec());
                }
                Mark::New => {
                    if let Some(cycle) = visit(dep, nodes, deps, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        stack.pop();
        marks[idx] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::New; nodes.len()];
    let mut stack = Vec::new();
    for idx in 0..nodes.len() {
        if marks[idx] == Mark::New {
            if let Some(cycle) = visit(idx, nodes, deps, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}
