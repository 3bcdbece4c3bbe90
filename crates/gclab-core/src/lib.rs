//! Trial planning primitives for the GC energy experiment: factor
//! declarations, exclusion rules, deterministic plan generation and the
//! batch gate that pauses between batches for operator review.

use std::collections::{BTreeMap, BTreeSet};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use thiserror::Error;

/// Fatal configuration faults. Raised before any trial runs; never during.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no_factors: a plan needs at least one factor")]
    NoFactors,
    #[error("empty_factor: factor '{0}' declares no levels")]
    EmptyFactor(String),
    #[error("duplicate_level: factor '{0}' declares level '{1}' more than once")]
    DuplicateLevel(String, String),
    #[error("bad_repetitions: repetitions must be >= 1 (got {0})")]
    BadRepetitions(u32),
    #[error("bad_batch_size: batch size must be > 0")]
    BadBatchSize,
    #[error("unknown_factor: exclusion references undeclared factor '{0}'")]
    UnknownFactor(String),
    #[error("unknown_level: exclusion references level '{1}' not declared by factor '{0}'")]
    UnknownLevel(String, String),
    #[error("unknown_subject: no remote script mapping for subject '{0}'")]
    UnknownSubject(String),
}

/// Operator interrupt during a batch pause. Propagates and halts the
/// remaining plan; results already recorded stay on disk.
#[derive(Debug, Error)]
#[error("cancelled: operator aborted the experiment")]
pub struct Cancelled;

/// One experimental dimension with its ordered, discrete levels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Factor {
    name: String,
    levels: Vec<String>,
}

impl Factor {
    pub fn new(
        name: impl Into<String>,
        levels: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        let levels: Vec<String> = levels.into_iter().map(Into::into).collect();
        if levels.is_empty() {
            return Err(ConfigError::EmptyFactor(name));
        }
        let mut seen = BTreeSet::new();
        for level in &levels {
            if !seen.insert(level.clone()) {
                return Err(ConfigError::DuplicateLevel(name.clone(), level.clone()));
            }
        }
        Ok(Self { name, levels })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }
}

/// A partial factor -> allowed-levels constraint. A combination matching
/// every constraint in full is omitted from the plan at generation time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionRule {
    constraints: BTreeMap<String, Vec<String>>,
}

impl ExclusionRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forbid(
        mut self,
        factor: impl Into<String>,
        levels: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.constraints
            .insert(factor.into(), levels.into_iter().map(Into::into).collect());
        self
    }

    pub fn from_constraints(constraints: BTreeMap<String, Vec<String>>) -> Self {
        Self { constraints }
    }

    pub fn constraints(&self) -> &BTreeMap<String, Vec<String>> {
        &self.constraints
    }

    /// True iff every constrained factor's assigned level sits in the
    /// rule's subset. An empty rule matches nothing.
    pub fn matches(&self, assignment: &BTreeMap<String, String>) -> bool {
        if self.constraints.is_empty() {
            return false;
        }
        self.constraints.iter().all(|(factor, levels)| {
            assignment
                .get(factor)
                .map(|assigned| levels.contains(assigned))
                .unwrap_or(false)
        })
    }
}

/// One planned trial: a full factor assignment plus repetition index and
/// the global sequence number assigned at plan-generation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialSpec {
    sequence: u64,
    repetition: u32,
    assignment: BTreeMap<String, String>,
}

impl TrialSpec {
    /// Global 1-based sequence number, strictly increasing, never reused.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// 0-based repetition index within the factor combination.
    pub fn repetition(&self) -> u32 {
        self.repetition
    }

    pub fn assignment(&self) -> &BTreeMap<String, String> {
        &self.assignment
    }

    pub fn level(&self, factor: &str) -> Option<&str> {
        self.assignment.get(factor).map(String::as_str)
    }
}

/// Enumerate the full trial plan: Cartesian product of factor levels in
/// declared order (first factor outermost), repetitions nested innermost,
/// exclusion filtering applied before sequence numbers are assigned so the
/// final sequence is gap-free from 1.
pub fn generate(
    factors: &[Factor],
    exclusions: &[ExclusionRule],
    repetitions: u32,
) -> Result<Vec<TrialSpec>, ConfigError> {
    if factors.is_empty() {
        return Err(ConfigError::NoFactors);
    }
    if repetitions < 1 {
        return Err(ConfigError::BadRepetitions(repetitions));
    }
    validate_exclusions(factors, exclusions)?;

    let mut combinations: Vec<BTreeMap<String, String>> = vec![BTreeMap::new()];
    for factor in factors {
        let mut next = Vec::with_capacity(combinations.len() * factor.levels().len());
        for partial in &combinations {
            for level in factor.levels() {
                let mut assignment = partial.clone();
                assignment.insert(factor.name().to_string(), level.clone());
                next.push(assignment);
            }
        }
        combinations = next;
    }

    let mut plan = Vec::new();
    let mut sequence = 0u64;
    for assignment in combinations {
        if exclusions.iter().any(|rule| rule.matches(&assignment)) {
            continue;
        }
        for repetition in 0..repetitions {
            sequence += 1;
            plan.push(TrialSpec {
                sequence,
                repetition,
                assignment: assignment.clone(),
            });
        }
    }
    Ok(plan)
}

fn validate_exclusions(
    factors: &[Factor],
    exclusions: &[ExclusionRule],
) -> Result<(), ConfigError> {
    let declared: BTreeMap<&str, &Factor> =
        factors.iter().map(|f| (f.name(), f)).collect();
    for rule in exclusions {
        for (name, levels) in rule.constraints() {
            let factor = declared
                .get(name.as_str())
                .ok_or_else(|| ConfigError::UnknownFactor(name.clone()))?;
            for level in levels {
                if !factor.levels().contains(level) {
                    return Err(ConfigError::UnknownLevel(name.clone(), level.clone()));
                }
            }
        }
    }
    Ok(())
}

/// 1-based batch number for a 1-based sequence number.
pub fn batch_number_for(sequence: u64, batch_size: u32) -> u64 {
    debug_assert!(batch_size > 0);
    (sequence + u64::from(batch_size) - 1) / u64::from(batch_size)
}

/// Pure form of the pause predicate: true exactly before trials
/// N+1, 2N+1, 3N+1, ... and never before trial 1.
pub fn should_pause_before(sequence: u64, batch_size: u32) -> bool {
    sequence > 1 && (sequence - 1) % u64::from(batch_size) == 0
}

/// Blocking wait for operator confirmation between batches. Cancellation
/// surfaces as `Cancelled` and must not be swallowed by callers.
pub trait OperatorGate {
    fn await_confirmation(&self) -> Result<(), Cancelled>;
}

/// Interactive gate: the operator presses ENTER to continue. A closed
/// stdin (EOF, or the terminal going away on interrupt) cancels.
pub struct StdinGate;

impl OperatorGate for StdinGate {
    fn await_confirmation(&self) -> Result<(), Cancelled> {
        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line) {
            Ok(0) => Err(Cancelled),
            Ok(_) => Ok(()),
            Err(_) => Err(Cancelled),
        }
    }
}

/// Unattended gate: confirms immediately. Used for `--yes` runs.
pub struct AutoGate;

impl OperatorGate for AutoGate {
    fn await_confirmation(&self) -> Result<(), Cancelled> {
        Ok(())
    }
}

/// Test/driver gate fed from an mpsc channel; a dropped sender cancels.
pub struct ChannelGate {
    rx: Receiver<()>,
}

impl ChannelGate {
    pub fn new(rx: Receiver<()>) -> Self {
        Self { rx }
    }
}

impl OperatorGate for ChannelGate {
    fn await_confirmation(&self) -> Result<(), Cancelled> {
        self.rx.recv().map_err(|_| Cancelled)
    }
}

/// Tracks progress through fixed-size batches and decides when to block
/// for operator confirmation. Batch numbering starts at 1.
#[derive(Debug)]
pub struct BatchGate {
    batch_size: u32,
    runs_in_batch: u32,
    current_batch: u64,
}

impl BatchGate {
    pub fn new(batch_size: u32) -> Result<Self, ConfigError> {
        if batch_size == 0 {
            return Err(ConfigError::BadBatchSize);
        }
        Ok(Self {
            batch_size,
            runs_in_batch: 0,
            current_batch: 1,
        })
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    pub fn current_batch(&self) -> u64 {
        self.current_batch
    }

    pub fn runs_in_batch(&self) -> u32 {
        self.runs_in_batch
    }

    /// True when the current batch is full and the next trial must wait
    /// for operator confirmation.
    pub fn should_pause_before_next(&self) -> bool {
        self.runs_in_batch >= self.batch_size
    }

    /// Block on the gate, then open the next batch.
    pub fn confirm_continuation(&mut self, gate: &dyn OperatorGate) -> Result<(), Cancelled> {
        gate.await_confirmation()?;
        self.runs_in_batch = 0;
        self.current_batch += 1;
        Ok(())
    }

    pub fn note_trial_started(&mut self) {
        self.runs_in_batch += 1;
    }
}

/// Explicit per-trial context handed to every lifecycle hook. Replaces
/// runtime introspection of whatever the framework happens to expose.
#[derive(Debug, Clone)]
pub struct TrialContext {
    pub spec: TrialSpec,
    pub batch_number: u64,
    pub run_dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn study_factors() -> Vec<Factor> {
        vec![
            Factor::new("gc", ["Serial", "Parallel", "G1"]).expect("gc factor"),
            Factor::new("workload", ["Light", "Heavy"]).expect("workload factor"),
        ]
    }

    #[test]
    fn factor_rejects_empty_and_duplicate_levels() {
        let empty: Vec<String> = Vec::new();
        assert!(matches!(
            Factor::new("gc", empty),
            Err(ConfigError::EmptyFactor(_))
        ));
        assert!(matches!(
            Factor::new("gc", ["G1", "G1"]),
            Err(ConfigError::DuplicateLevel(_, _))
        ));
    }

    #[test]
    fn generate_enumerates_product_times_repetitions() {
        let plan = generate(&study_factors(), &[], 3).expect("plan");
        assert_eq!(plan.len(), 3 * 2 * 3);
        for (i, spec) in plan.iter().enumerate() {
            assert_eq!(spec.sequence(), i as u64 + 1, "gap-free 1-based sequence");
        }
    }

    #[test]
    fn generate_orders_first_factor_outermost_and_repetitions_innermost() {
        let plan = generate(&study_factors(), &[], 2).expect("plan");
        assert_eq!(plan[0].level("gc"), Some("Serial"));
        assert_eq!(plan[0].level("workload"), Some("Light"));
        assert_eq!(plan[0].repetition(), 0);
        assert_eq!(plan[1].level("workload"), Some("Light"));
        assert_eq!(plan[1].repetition(), 1);
        assert_eq!(plan[2].level("workload"), Some("Heavy"));
        assert_eq!(plan[2].repetition(), 0);
        assert_eq!(plan[4].level("gc"), Some("Parallel"));
    }

    #[test]
    fn exclusion_removes_whole_combination_before_sequencing() {
        let rule = ExclusionRule::new()
            .forbid("gc", ["G1"])
            .forbid("workload", ["Heavy"]);
        let plan = generate(&study_factors(), &[rule], 2).expect("plan");
        assert_eq!(plan.len(), (3 * 2 - 1) * 2);
        assert!(plan
            .iter()
            .all(|s| !(s.level("gc") == Some("G1") && s.level("workload") == Some("Heavy"))));
        let last = plan.last().expect("non-empty plan");
        assert_eq!(last.sequence(), plan.len() as u64, "no sequence gaps");
    }

    #[test]
    fn non_matching_exclusion_leaves_plan_unchanged() {
        let baseline = generate(&study_factors(), &[], 2).expect("baseline");
        // An empty rule and an empty-subset rule both match zero specs.
        let inert = vec![
            ExclusionRule::new(),
            ExclusionRule::new().forbid("workload", Vec::<String>::new()),
        ];
        let with_rules = generate(&study_factors(), &inert, 2).expect("plan");
        assert_eq!(baseline, with_rules);
    }

    #[test]
    fn generate_rejects_bad_inputs() {
        assert!(matches!(generate(&[], &[], 1), Err(ConfigError::NoFactors)));
        assert!(matches!(
            generate(&study_factors(), &[], 0),
            Err(ConfigError::BadRepetitions(0))
        ));
        let unknown_factor = ExclusionRule::new().forbid("jdk", ["openjdk"]);
        assert!(matches!(
            generate(&study_factors(), &[unknown_factor], 1),
            Err(ConfigError::UnknownFactor(_))
        ));
        let unknown_level = ExclusionRule::new().forbid("gc", ["Shenandoah"]);
        assert!(matches!(
            generate(&study_factors(), &[unknown_level], 1),
            Err(ConfigError::UnknownLevel(_, _))
        ));
    }

    #[test]
    fn batch_numbers_follow_ceiling_rule() {
        assert_eq!(batch_number_for(1, 36), 1);
        assert_eq!(batch_number_for(36, 36), 1);
        assert_eq!(batch_number_for(37, 36), 2);
        assert_eq!(batch_number_for(73, 36), 3);
    }

    #[test]
    fn pause_predicate_fires_exactly_at_batch_boundaries() {
        let hits: Vec<u64> = (1..=10).filter(|&s| should_pause_before(s, 3)).collect();
        assert_eq!(hits, vec![4, 7, 10]);
        assert!(!should_pause_before(1, 3), "never before trial 1");
    }

    #[test]
    fn batch_gate_pauses_after_batch_size_trials() {
        let mut gate = BatchGate::new(2).expect("gate");
        assert!(!gate.should_pause_before_next());
        gate.note_trial_started();
        assert!(!gate.should_pause_before_next());
        gate.note_trial_started();
        assert!(gate.should_pause_before_next());

        gate.confirm_continuation(&AutoGate).expect("auto confirm");
        assert_eq!(gate.current_batch(), 2);
        assert!(!gate.should_pause_before_next());
    }

    #[test]
    fn batch_gate_rejects_zero_size() {
        assert!(matches!(BatchGate::new(0), Err(ConfigError::BadBatchSize)));
    }

    #[test]
    fn channel_gate_confirms_and_cancels() {
        let (tx, rx) = mpsc::channel();
        let gate = ChannelGate::new(rx);
        tx.send(()).expect("send confirmation");
        gate.await_confirmation().expect("confirmed");
        drop(tx);
        assert!(gate.await_confirmation().is_err(), "dropped sender cancels");
    }

    #[test]
    fn cancellation_propagates_through_batch_gate() {
        let (tx, rx) = mpsc::channel::<()>();
        drop(tx);
        let mut gate = BatchGate::new(1).expect("gate");
        gate.note_trial_started();
        assert!(gate.should_pause_before_next());
        let err = gate
            .confirm_continuation(&ChannelGate::new(rx))
            .expect_err("must cancel");
        assert!(err.to_string().contains("cancelled"));
        // The failed confirmation must not advance the batch.
        assert_eq!(gate.current_batch(), 1);
    }
}
