//! Experiment runner for the Java GC energy study: remote execution of
//! trials on the device under test (DUT) over ssh, artifact retrieval over
//! scp, result parsing, and the lifecycle driver that walks the trial plan
//! one run at a time.

use anyhow::{anyhow, Context as _, Result};
use chrono::Utc;
use gclab_core::{
    batch_number_for, generate, BatchGate, ConfigError, ExclusionRule, Factor, OperatorGate,
    StdinGate, TrialContext, TrialSpec,
};
use gclab_measure::{write_energy_csv, SyntheticMeter};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const CONNECTION_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// How much remote stderr is kept for diagnostics on a failed trial.
pub const STDERR_EXCERPT_LIMIT: usize = 500;

/// Result files the DUT-side scripts leave under results/run_<sequence>/.
pub const RESULT_FILENAMES: [&str; 2] = ["energy.csv", "result.csv"];

/// The fixed-format record consumed by the result parser.
pub const RESULT_FILENAME: &str = "result.csv";

/// Sentinel the DUT writes into a numeric field when its own measurement
/// failed; maps to a null value, not a parse error.
pub const FAILED_SENTINEL: &str = "FAILED";

// ---------------------------------------------------------------------------
// Remote session and environment configuration
// ---------------------------------------------------------------------------

/// Connection parameters for the DUT. Supplied once at experiment start
/// from the environment and immutable for the experiment's lifetime.
#[derive(Debug, Clone)]
pub struct RemoteSession {
    pub user: String,
    pub host: String,
    pub experiment_dir: String,
    pub timeout: Duration,
}

impl RemoteSession {
    pub fn from_env() -> Result<Self> {
        let timeout_raw = env_or("DUT_TIMEOUT_SECONDS", "900");
        let timeout_secs: u64 = timeout_raw
            .parse()
            .map_err(|_| anyhow!("dut_timeout_invalid: {}", timeout_raw))?;
        Ok(Self {
            user: env_or("DUT_USER", "greenlab"),
            host: env_or("DUT_HOST", "192.168.50.1"),
            experiment_dir: env_or("DUT_EXPERIMENT_DIR", "/home/greenlab/greenlab-dut"),
            timeout: Duration::from_secs(timeout_secs.max(1)),
        })
    }

    pub fn target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// ENERGY_MOCK_MODE=true selects the synthetic measurement path.
pub fn mock_mode_from_env() -> bool {
    std::env::var("ENERGY_MOCK_MODE")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Experiment configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct FactorDef {
    pub name: String,
    pub levels: Vec<String>,
}

/// Categorical kind of a subject program; decides which DUT-side script
/// runs it. Library/benchmark subjects run to completion on their own,
/// service-style applications need the driver script that starts and
/// stops them around the workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Benchmark,
    Service,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptNames {
    #[serde(default = "default_benchmark_script")]
    pub benchmark: String,
    #[serde(default = "default_service_script")]
    pub service: String,
}

impl Default for ScriptNames {
    fn default() -> Self {
        Self {
            benchmark: default_benchmark_script(),
            service: default_service_script(),
        }
    }
}

fn default_benchmark_script() -> String {
    "run_single_experiment.sh".to_string()
}

fn default_service_script() -> String {
    "run_service_experiment.sh".to_string()
}

fn default_cooldown_ms() -> u64 {
    2000
}

fn default_seed() -> u64 {
    gclab_measure::DEFAULT_SEED
}

/// Declarative experiment design, loadable from JSON. The default value
/// embeds the full GC energy study.
#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    pub factors: Vec<FactorDef>,
    #[serde(default)]
    pub exclusions: Vec<BTreeMap<String, Vec<String>>>,
    pub repetitions: u32,
    pub batch_size: u32,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub subjects: BTreeMap<String, SubjectKind>,
    #[serde(default)]
    pub scripts: ScriptNames,
}

impl ExperimentConfig {
    /// The full study design: 8 subjects x 3 collectors x 3 workload
    /// intensities x 2 JDK vendors, 3 repetitions, reviewed in batches
    /// of 36.
    pub fn default_study() -> Self {
        let benchmarks = [
            "DaCapo",
            "CLBG-BinaryTrees",
            "CLBG-Fannkuch",
            "CLBG-NBody",
            "Rosetta",
            "ANDIE",
        ];
        let services = ["PetClinic", "TodoApp"];
        let mut subjects = BTreeMap::new();
        for name in benchmarks {
            subjects.insert(name.to_string(), SubjectKind::Benchmark);
        }
        for name in services {
            subjects.insert(name.to_string(), SubjectKind::Service);
        }
        Self {
            name: "gc_energy_experiment".to_string(),
            factors: vec![
                FactorDef {
                    name: "subject".to_string(),
                    levels: benchmarks
                        .iter()
                        .chain(services.iter())
                        .map(|s| s.to_string())
                        .collect(),
                },
                FactorDef {
                    name: "gc".to_string(),
                    levels: vec!["Serial".into(), "Parallel".into(), "G1".into()],
                },
                FactorDef {
                    name: "workload".to_string(),
                    levels: vec!["Light".into(), "Medium".into(), "Heavy".into()],
                },
                FactorDef {
                    name: "jdk".to_string(),
                    levels: vec!["openjdk".into(), "oracle".into()],
                },
            ],
            exclusions: Vec::new(),
            repetitions: 3,
            batch_size: 36,
            cooldown_ms: default_cooldown_ms(),
            seed: default_seed(),
            subjects,
            scripts: ScriptNames::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("config_not_found: {}", path.display()))?;
        let config: Self = serde_json::from_slice(&bytes)
            .with_context(|| format!("config_invalid: {}", path.display()))?;
        Ok(config)
    }

    pub fn factors(&self) -> Result<Vec<Factor>, ConfigError> {
        self.factors
            .iter()
            .map(|def| Factor::new(def.name.clone(), def.levels.clone()))
            .collect()
    }

    pub fn exclusion_rules(&self) -> Vec<ExclusionRule> {
        self.exclusions
            .iter()
            .cloned()
            .map(ExclusionRule::from_constraints)
            .collect()
    }

    /// Validate the design and enumerate the full ordered plan.
    pub fn build_plan(&self) -> Result<Vec<TrialSpec>, ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::BadBatchSize);
        }
        let factors = self.factors()?;
        generate(&factors, &self.exclusion_rules(), self.repetitions)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Explicit subject -> remote-script mapping, resolved once at
/// configuration time. Every declared subject level must be routable
/// before any trial runs; string containment on subject names is not
/// consulted.
#[derive(Debug, Clone)]
pub struct SubjectRouter {
    scripts: BTreeMap<String, String>,
}

impl SubjectRouter {
    pub fn resolve(config: &ExperimentConfig) -> Result<Self, ConfigError> {
        let mut scripts = BTreeMap::new();
        let subject_levels = config
            .factors
            .iter()
            .find(|f| f.name == "subject")
            .map(|f| f.levels.as_slice())
            .unwrap_or(&[]);
        for subject in subject_levels {
            let kind = config
                .subjects
                .get(subject)
                .ok_or_else(|| ConfigError::UnknownSubject(subject.clone()))?;
            let script = match kind {
                SubjectKind::Benchmark => config.scripts.benchmark.clone(),
                SubjectKind::Service => config.scripts.service.clone(),
            };
            scripts.insert(subject.clone(), script);
        }
        Ok(Self { scripts })
    }

    pub fn script_for(&self, subject: &str) -> Result<&str, ConfigError> {
        self.scripts
            .get(subject)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::UnknownSubject(subject.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Remote execution client
// ---------------------------------------------------------------------------

/// Classified outcome of one remote trial invocation. Produced exactly
/// once per attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success,
    Failed {
        exit_code: i32,
        stderr_excerpt: String,
    },
    TimedOut,
}

/// The single-line invocation the DUT receives per trial.
pub fn build_remote_command(session: &RemoteSession, script: &str, spec: &TrialSpec) -> String {
    format!(
        "cd {} && ./{} {} {} {} {} {} {}",
        session.experiment_dir,
        script,
        spec.level("subject").unwrap_or("-"),
        spec.level("gc").unwrap_or("-"),
        spec.level("workload").unwrap_or("-"),
        spec.level("jdk").unwrap_or("-"),
        spec.repetition(),
        spec.sequence(),
    )
}

pub trait RemoteExecutor {
    fn execute(&self, session: &RemoteSession, command: &str) -> Result<ExecutionOutcome>;
}

/// Issues the command as a single `ssh user@host <command>` invocation
/// with a bounded wait enforced controller-side.
pub struct SshExecutor;

impl RemoteExecutor for SshExecutor {
    fn execute(&self, session: &RemoteSession, command: &str) -> Result<ExecutionOutcome> {
        let mut cmd = Command::new("ssh");
        cmd.arg(session.target()).arg(command);
        run_with_deadline(cmd, session.timeout)
    }
}

/// Spawn `cmd` and wait up to `timeout` for it to finish, draining stdout
/// and stderr off-thread so a chatty remote cannot fill the pipes. On
/// timeout the child is abandoned, not killed: the remote process's
/// residual state is untracked, which mirrors the DUT-side contract.
pub fn run_with_deadline(mut cmd: Command, timeout: Duration) -> Result<ExecutionOutcome> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let mut child = cmd.spawn().context("remote_spawn_failed")?;

    let stdout = child.stdout.take().map(drain_pipe);
    let stderr = child.stderr.take().map(drain_pipe);

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().context("remote_wait_failed")? {
            let _ = stdout.map(join_drained);
            let stderr_text = stderr.map(join_drained).unwrap_or_default();
            return Ok(classify_exit(status.code(), &stderr_text));
        }
        if Instant::now() >= deadline {
            return Ok(ExecutionOutcome::TimedOut);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn drain_pipe<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        let _ = reader.read_to_string(&mut buf);
        buf
    })
}

fn join_drained(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

fn classify_exit(code: Option<i32>, stderr: &str) -> ExecutionOutcome {
    match code {
        Some(0) => ExecutionOutcome::Success,
        Some(exit_code) => ExecutionOutcome::Failed {
            exit_code,
            stderr_excerpt: stderr_excerpt(stderr),
        },
        // Killed by signal: no exit code to report.
        None => ExecutionOutcome::Failed {
            exit_code: -1,
            stderr_excerpt: stderr_excerpt(stderr),
        },
    }
}

pub fn stderr_excerpt(stderr: &str) -> String {
    stderr.chars().take(STDERR_EXCERPT_LIMIT).collect()
}

// ---------------------------------------------------------------------------
// Artifact retrieval
// ---------------------------------------------------------------------------

/// One file transfer from the DUT back to the controller. Returns plain
/// success/failure; retrieval faults are recorded, never raised.
pub trait ArtifactTransfer {
    fn fetch(&self, session: &RemoteSession, remote_path: &str, local_path: &Path) -> bool;
}

pub struct ScpTransfer;

impl ArtifactTransfer for ScpTransfer {
    fn fetch(&self, session: &RemoteSession, remote_path: &str, local_path: &Path) -> bool {
        Command::new("scp")
            .arg(format!("{}:{}", session.target(), remote_path))
            .arg(local_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

pub fn remote_result_dir(session: &RemoteSession, sequence: u64) -> String {
    format!("{}/results/run_{}", session.experiment_dir, sequence)
}

/// Pull the expected result files for one trial into `local_dir`,
/// creating it first. Each file succeeds or fails independently.
pub fn retrieve(
    session: &RemoteSession,
    sequence: u64,
    local_dir: &Path,
    transfer: &dyn ArtifactTransfer,
) -> Result<BTreeMap<String, bool>> {
    fs::create_dir_all(local_dir)
        .with_context(|| format!("local_dir_create_failed: {}", local_dir.display()))?;
    let remote_dir = remote_result_dir(session, sequence);
    let mut outcome = BTreeMap::new();
    for name in RESULT_FILENAMES {
        let remote_path = format!("{}/{}", remote_dir, name);
        let fetched = transfer.fetch(session, &remote_path, &local_dir.join(name));
        if fetched {
            info!(file = name, sequence, "retrieved result artifact");
        } else {
            warn!(file = name, sequence, "failed to retrieve result artifact");
        }
        outcome.insert(name.to_string(), fetched);
    }
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Result parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialStatus {
    Success,
    Failed,
    TimedOut,
    Missing,
}

impl TrialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrialStatus::Success => "SUCCESS",
            TrialStatus::Failed => "FAILED",
            TrialStatus::TimedOut => "TIMEOUT",
            TrialStatus::Missing => "MISSING",
        }
    }

    fn from_token(token: &str) -> Self {
        match token.trim() {
            "SUCCESS" => TrialStatus::Success,
            "TIMEOUT" => TrialStatus::TimedOut,
            _ => TrialStatus::Failed,
        }
    }
}

/// Where the numbers came from: real DUT artifacts or the synthetic
/// measurement model. Synthetic data must never pass as calibrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    Dut,
    Synthetic,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::Dut => "dut",
            DataSource::Synthetic => "synthetic",
        }
    }
}

/// Terminal record for one trial. Numeric fields are null exactly when
/// the status is not SUCCESS or the DUT reported its sentinel token.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialResult {
    pub sequence: u64,
    pub repetition: u32,
    pub runtime_s: Option<f64>,
    pub energy_j: Option<f64>,
    pub status: TrialStatus,
    pub batch_number: u64,
    pub source: DataSource,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    pub runtime_s: Option<f64>,
    pub energy_j: Option<f64>,
    pub status: TrialStatus,
}

impl ParsedRecord {
    fn empty(status: TrialStatus) -> Self {
        Self {
            runtime_s: None,
            energy_j: None,
            status,
        }
    }
}

/// Parse the single-line result record. Fields: 0-5 echo the trial
/// identity, 6 runtime seconds, 7 energy joules, 8 status token, the rest
/// free-form. Degrades to MISSING/FAILED records instead of erroring.
pub fn parse_result_record(line: &str) -> ParsedRecord {
    let parts: Vec<&str> = line.trim().split(',').collect();
    if parts.len() < 9 {
        return ParsedRecord::empty(TrialStatus::Missing);
    }
    let runtime = parse_measure_field(parts[6]);
    let energy = parse_measure_field(parts[7]);
    match (runtime, energy) {
        (Some(runtime_s), Some(energy_j)) => ParsedRecord {
            runtime_s,
            energy_j,
            status: TrialStatus::from_token(parts[8]),
        },
        _ => ParsedRecord::empty(TrialStatus::Failed),
    }
}

/// Outer Option: did the field parse at all. Inner Option: the sentinel
/// maps to a null measurement rather than a parse failure.
fn parse_measure_field(raw: &str) -> Option<Option<f64>> {
    let raw = raw.trim();
    if raw == FAILED_SENTINEL {
        return Some(None);
    }
    raw.parse::<f64>().ok().map(Some)
}

/// Read and parse `result.csv` from a trial's retrieved artifacts. A
/// missing file is a MISSING record, never an error.
pub fn parse_result_file(local_dir: &Path) -> ParsedRecord {
    let path = local_dir.join(RESULT_FILENAME);
    match fs::read_to_string(&path) {
        Ok(data) => parse_result_record(data.lines().next().unwrap_or("")),
        Err(_) => {
            warn!(path = %path.display(), "result file not found");
            ParsedRecord::empty(TrialStatus::Missing)
        }
    }
}

// ---------------------------------------------------------------------------
// Run table report
// ---------------------------------------------------------------------------

pub const RUN_TABLE_FILENAME: &str = "run_table.csv";
pub const RUN_TABLE_HEADER: &str =
    "sequence,batch,subject,gc,workload,jdk,repetition,runtime_s,energy_j,status,source";

/// Append-only run table: one row per trial, written as each trial
/// finishes so an aborted experiment keeps everything recorded so far.
pub struct RunTableWriter {
    path: PathBuf,
}

impl RunTableWriter {
    pub fn create(results_root: &Path) -> Result<Self> {
        fs::create_dir_all(results_root).with_context(|| {
            format!("results_root_create_failed: {}", results_root.display())
        })?;
        let path = results_root.join(RUN_TABLE_FILENAME);
        fs::write(&path, format!("{}\n", RUN_TABLE_HEADER))
            .with_context(|| format!("run_table_create_failed: {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn append(&self, spec: &TrialSpec, result: &TrialResult) -> Result<()> {
        let row = format!(
            "{},{},{},{},{},{},{},{},{},{},{}\n",
            result.sequence,
            result.batch_number,
            spec.level("subject").unwrap_or("-"),
            spec.level("gc").unwrap_or("-"),
            spec.level("workload").unwrap_or("-"),
            spec.level("jdk").unwrap_or("-"),
            result.repetition,
            format_opt(result.runtime_s),
            format_opt(result.energy_j),
            result.status.as_str(),
            result.source.as_str(),
        );
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("run_table_open_failed: {}", self.path.display()))?;
        file.write_all(row.as_bytes())?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn format_opt(value: Option<f64>) -> String {
    value.map(|v| format!("{:.6}", v)).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Lifecycle hooks and driver
// ---------------------------------------------------------------------------

/// The fixed hook points the lifecycle driver invokes per trial, in
/// order. `interact` is the primary execution point and may block for the
/// duration of the remote trial.
pub trait ExperimentHooks {
    fn before_experiment(&mut self) -> Result<()> {
        Ok(())
    }
    fn before_run(&mut self) -> Result<()> {
        Ok(())
    }
    fn start_run(&mut self, _ctx: &TrialContext) -> Result<()> {
        Ok(())
    }
    fn start_measurement(&mut self, _ctx: &TrialContext) -> Result<()> {
        Ok(())
    }
    fn interact(&mut self, _ctx: &TrialContext) -> Result<()> {
        Ok(())
    }
    fn stop_measurement(&mut self, _ctx: &TrialContext) -> Result<()> {
        Ok(())
    }
    fn stop_run(&mut self, _ctx: &TrialContext) -> Result<()> {
        Ok(())
    }
    fn populate_run_data(&mut self, _ctx: &TrialContext) -> Result<Option<TrialResult>> {
        Ok(None)
    }
    fn after_experiment(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub results_root: PathBuf,
    pub batch_size: u32,
    pub cooldown: Duration,
}

/// Walk the plan strictly one trial at a time. Per-trial faults are
/// captured in the TrialResult; only configuration faults before the loop
/// and operator cancellation during a batch pause abort the run. Rows are
/// flushed to the run table as they finish, so results recorded before a
/// cancellation survive it.
pub fn run_plan<H: ExperimentHooks>(
    hooks: &mut H,
    plan: &[TrialSpec],
    options: &DriverOptions,
) -> Result<Vec<TrialResult>> {
    let total_batches = plan
        .last()
        .map(|spec| batch_number_for(spec.sequence(), options.batch_size))
        .unwrap_or(0);
    info!(
        trials = plan.len(),
        batch_size = options.batch_size,
        total_batches,
        "starting experiment"
    );

    hooks.before_experiment()?;
    let writer = RunTableWriter::create(&options.results_root)?;
    let mut results = Vec::with_capacity(plan.len());

    for (index, spec) in plan.iter().enumerate() {
        hooks.before_run()?;

        let ctx = TrialContext {
            spec: spec.clone(),
            batch_number: batch_number_for(spec.sequence(), options.batch_size),
            run_dir: options
                .results_root
                .join(format!("run_{}", spec.sequence())),
        };
        fs::create_dir_all(&ctx.run_dir)
            .with_context(|| format!("run_dir_create_failed: {}", ctx.run_dir.display()))?;

        hooks.start_run(&ctx)?;
        hooks.start_measurement(&ctx)?;
        hooks.interact(&ctx)?;
        hooks.stop_measurement(&ctx)?;
        hooks.stop_run(&ctx)?;

        let result = hooks
            .populate_run_data(&ctx)?
            .unwrap_or_else(|| missing_result(&ctx));
        writer.append(spec, &result)?;
        results.push(result);

        if index + 1 < plan.len() && !options.cooldown.is_zero() {
            thread::sleep(options.cooldown);
        }
    }

    hooks.after_experiment()?;
    Ok(results)
}

fn missing_result(ctx: &TrialContext) -> TrialResult {
    TrialResult {
        sequence: ctx.spec.sequence(),
        repetition: ctx.spec.repetition(),
        runtime_s: None,
        energy_j: None,
        status: TrialStatus::Missing,
        batch_number: ctx.batch_number,
        source: DataSource::Dut,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Execute trials on the DUT over ssh and pull real artifacts back.
    Remote,
    /// Synthesize DUT artifacts locally with the seeded measurement
    /// model; no ssh traffic at all.
    Mock,
}

/// The GC energy study wired into the lifecycle hook protocol.
pub struct GcEnergyExperiment {
    session: RemoteSession,
    router: SubjectRouter,
    gate: BatchGate,
    mode: ExecutionMode,
    results_root: PathBuf,
    meter: SyntheticMeter,
    executor: Box<dyn RemoteExecutor>,
    transfer: Box<dyn ArtifactTransfer>,
    operator: Box<dyn OperatorGate>,
    current_command: Option<String>,
    current_outcome: Option<ExecutionOutcome>,
}

impl GcEnergyExperiment {
    pub fn new(
        session: RemoteSession,
        router: SubjectRouter,
        gate: BatchGate,
        mode: ExecutionMode,
        results_root: PathBuf,
    ) -> Self {
        Self {
            session,
            router,
            gate,
            mode,
            results_root,
            meter: SyntheticMeter::default(),
            executor: Box::new(SshExecutor),
            transfer: Box::new(ScpTransfer),
            operator: Box::new(StdinGate),
            current_command: None,
            current_outcome: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.meter = SyntheticMeter::new(seed);
        self
    }

    pub fn with_executor(mut self, executor: Box<dyn RemoteExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_transfer(mut self, transfer: Box<dyn ArtifactTransfer>) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn with_operator(mut self, operator: Box<dyn OperatorGate>) -> Self {
        self.operator = operator;
        self
    }

    fn artifacts_dir(ctx: &TrialContext) -> PathBuf {
        ctx.run_dir.join("dut_results")
    }

    /// Mock mode stands in for the DUT: it writes the same artifact files
    /// a real run would leave behind, so retrieval and parsing downstream
    /// are exercised unchanged.
    fn synthesize_artifacts(&mut self, ctx: &TrialContext) -> Result<()> {
        let spec = &ctx.spec;
        let measurement = self.meter.simulate(
            spec.level("gc").unwrap_or(""),
            spec.level("workload").unwrap_or(""),
            spec.level("jdk").unwrap_or(""),
        );
        let dir = Self::artifacts_dir(ctx);
        fs::create_dir_all(&dir)
            .with_context(|| format!("artifacts_dir_create_failed: {}", dir.display()))?;
        write_energy_csv(&dir.join("energy.csv"), &measurement)?;
        let record = format!(
            "run_{},{},{},{},{},{},{:.6},{:.6},SUCCESS,{}\n",
            spec.sequence(),
            spec.level("subject").unwrap_or("-"),
            spec.level("gc").unwrap_or("-"),
            spec.level("workload").unwrap_or("-"),
            spec.level("jdk").unwrap_or("-"),
            spec.repetition(),
            measurement.runtime_seconds,
            measurement.energy_joules,
            Utc::now().timestamp(),
        );
        fs::write(dir.join(RESULT_FILENAME), record)?;
        Ok(())
    }
}

impl ExperimentHooks for GcEnergyExperiment {
    fn before_experiment(&mut self) -> Result<()> {
        info!(
            mode = ?self.mode,
            batch_size = self.gate.batch_size(),
            results_root = %self.results_root.display(),
            "GC energy experiment starting"
        );
        if self.mode == ExecutionMode::Remote {
            let probe_session = self.session.clone().with_timeout(CONNECTION_PROBE_TIMEOUT);
            match self
                .executor
                .execute(&probe_session, "echo gclab-connection-probe")
            {
                Ok(ExecutionOutcome::Success) => {
                    info!(dut = %self.session.target(), "DUT connection probe succeeded")
                }
                Ok(other) => {
                    warn!(dut = %self.session.target(), outcome = ?other, "DUT connection probe failed; check configuration")
                }
                Err(err) => {
                    warn!(dut = %self.session.target(), error = %err, "DUT connection probe errored; check configuration")
                }
            }
        }
        Ok(())
    }

    fn before_run(&mut self) -> Result<()> {
        if self.gate.should_pause_before_next() {
            info!(
                batch = self.gate.current_batch(),
                "batch complete; waiting for operator confirmation"
            );
            self.gate.confirm_continuation(self.operator.as_ref())?;
            info!(batch = self.gate.current_batch(), "operator confirmed; continuing");
        }
        Ok(())
    }

    fn start_run(&mut self, ctx: &TrialContext) -> Result<()> {
        self.gate.note_trial_started();
        info!(
            sequence = ctx.spec.sequence(),
            batch = ctx.batch_number,
            subject = ctx.spec.level("subject").unwrap_or("-"),
            gc = ctx.spec.level("gc").unwrap_or("-"),
            workload = ctx.spec.level("workload").unwrap_or("-"),
            jdk = ctx.spec.level("jdk").unwrap_or("-"),
            repetition = ctx.spec.repetition(),
            "starting trial"
        );
        Ok(())
    }

    fn start_measurement(&mut self, ctx: &TrialContext) -> Result<()> {
        if self.mode == ExecutionMode::Remote {
            let subject = ctx.spec.level("subject").unwrap_or("-");
            let script = self.router.script_for(subject)?;
            let command = build_remote_command(&self.session, script, &ctx.spec);
            info!(sequence = ctx.spec.sequence(), command = %command, "prepared remote invocation");
            self.current_command = Some(command);
        }
        Ok(())
    }

    fn interact(&mut self, ctx: &TrialContext) -> Result<()> {
        let outcome = match self.mode {
            ExecutionMode::Mock => {
                self.synthesize_artifacts(ctx)?;
                ExecutionOutcome::Success
            }
            ExecutionMode::Remote => {
                let command = self
                    .current_command
                    .take()
                    .ok_or_else(|| anyhow!("interact_without_command"))?;
                // A client-side execution error (e.g. ssh itself failing
                // to spawn) is still one trial's fault, not the plan's.
                match self.executor.execute(&self.session, &command) {
                    Ok(outcome) => outcome,
                    Err(err) => ExecutionOutcome::Failed {
                        exit_code: -1,
                        stderr_excerpt: stderr_excerpt(&err.to_string()),
                    },
                }
            }
        };
        match &outcome {
            ExecutionOutcome::Success => {
                info!(sequence = ctx.spec.sequence(), "trial completed on DUT")
            }
            ExecutionOutcome::Failed {
                exit_code,
                stderr_excerpt,
            } => warn!(
                sequence = ctx.spec.sequence(),
                exit_code,
                stderr = %stderr_excerpt,
                "trial failed on DUT"
            ),
            ExecutionOutcome::TimedOut => warn!(
                sequence = ctx.spec.sequence(),
                timeout_s = self.session.timeout.as_secs(),
                "trial timed out; remote process abandoned"
            ),
        }
        self.current_outcome = Some(outcome);
        Ok(())
    }

    fn stop_measurement(&mut self, ctx: &TrialContext) -> Result<()> {
        if self.mode == ExecutionMode::Remote
            && self.current_outcome == Some(ExecutionOutcome::Success)
        {
            retrieve(
                &self.session,
                ctx.spec.sequence(),
                &Self::artifacts_dir(ctx),
                self.transfer.as_ref(),
            )?;
        }
        Ok(())
    }

    fn stop_run(&mut self, ctx: &TrialContext) -> Result<()> {
        info!(
            sequence = ctx.spec.sequence(),
            batch = ctx.batch_number,
            "trial finished"
        );
        Ok(())
    }

    fn populate_run_data(&mut self, ctx: &TrialContext) -> Result<Option<TrialResult>> {
        let source = match self.mode {
            ExecutionMode::Mock => DataSource::Synthetic,
            ExecutionMode::Remote => DataSource::Dut,
        };
        let (runtime_s, energy_j, status) = match self.current_outcome.take() {
            Some(ExecutionOutcome::Success) => {
                let record = parse_result_file(&Self::artifacts_dir(ctx));
                (record.runtime_s, record.energy_j, record.status)
            }
            Some(ExecutionOutcome::Failed { .. }) => (None, None, TrialStatus::Failed),
            Some(ExecutionOutcome::TimedOut) => (None, None, TrialStatus::TimedOut),
            None => (None, None, TrialStatus::Missing),
        };
        let result = TrialResult {
            sequence: ctx.spec.sequence(),
            repetition: ctx.spec.repetition(),
            runtime_s,
            energy_j,
            status,
            batch_number: ctx.batch_number,
            source,
        };
        info!(
            sequence = result.sequence,
            status = result.status.as_str(),
            runtime_s = ?result.runtime_s,
            energy_j = ?result.energy_j,
            source = result.source.as_str(),
            "trial result recorded"
        );
        Ok(Some(result))
    }

    fn after_experiment(&mut self) -> Result<()> {
        let csv_files = walkdir::WalkDir::new(&self.results_root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry.file_type().is_file()
                    && entry.path().extension().map(|e| e == "csv").unwrap_or(false)
            })
            .count();
        info!(
            results_root = %self.results_root.display(),
            csv_files,
            "experiment complete"
        );
        Ok(())
    }
}
