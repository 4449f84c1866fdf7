//! BatchLrms - Grid Engine 系バッチキューの汎用 Lrms
//!
//! コマンドの実行そのものは `CommandExecutor` に任せる。
//! ローカル実行は `LocalExecutor`（tokio::process）。SSH 越しの実行はこの crate の外で
//! 同じ trait を実装する。
//!
//! | 操作 | コマンド |
//! |---|---|
//! | submit | `qsub`（出力 `Your job <id> ("<name>") has been submitted` から id を取る） |
//! | check_status | `qstat`、一覧に無ければ `qacct -j <id>` |
//! | get_results | `ls -1 <spool_dir>` から `<name>.o<id>` / `<name>.e<id>` を拾う |
//! | cancel | `qdel <id>` |
//! | get_resource_status | `qstat -u '*'` と `qstat -g c` |

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{
    Application, Artifact, JobHandle, JobStatus, LrmsError, ResourceDescriptor, ResourceStatus,
};
use crate::ports::{Clock, Lrms, SystemClock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs one shell command line on the batch front-end.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &str) -> Result<CommandOutput, LrmsError>;
}

/// `sh -c` on the local host.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalExecutor;

#[async_trait]
impl CommandExecutor for LocalExecutor {
    async fn execute(&self, command: &str) -> Result<CommandOutput, LrmsError> {
        debug!(command, "running batch command");
        let output = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| LrmsError::Failed(format!("cannot run `{command}`: {e}")))?;
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(flatten)]
    pub descriptor: ResourceDescriptor,
    /// Directory on the front-end receiving `<name>.o<id>` / `<name>.e<id>`.
    pub spool_dir: String,
    #[serde(default)]
    pub parallel_environment: Option<String>,
}

pub struct BatchLrms<E> {
    executor: E,
    config: BatchConfig,
    clock: Arc<dyn Clock>,
}

impl<E: CommandExecutor> BatchLrms<E> {
    pub fn new(executor: E, config: BatchConfig) -> Self {
        Self {
            executor,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn qsub_command(&self, app: &Application) -> String {
        let spool = sh_quote(&self.config.spool_dir);
        let mut argv = vec![
            "qsub".to_string(),
            "-N".into(),
            sh_quote(&job_name(&app.name)),
            "-o".into(),
            spool.clone(),
            "-e".into(),
            spool,
        ];
        if app.requested_walltime > 0 {
            argv.push("-l".into());
            argv.push(format!("h_rt={}", app.requested_walltime));
        }
        if app.requested_memory > 0 {
            argv.push("-l".into());
            argv.push(format!("h_vmem={}M", app.requested_memory));
        }
        if app.requested_cores > 1
            && let Some(pe) = &self.config.parallel_environment
        {
            argv.push("-pe".into());
            argv.push(sh_quote(pe));
            argv.push(app.requested_cores.to_string());
        }
        argv.push("-b".into());
        argv.push("y".into());
        argv.push(sh_quote(&app.executable));
        argv.extend(app.arguments.iter().map(|a| sh_quote(a)));
        argv.join(" ")
    }

    async fn run(&self, command: &str) -> Result<CommandOutput, LrmsError> {
        self.executor.execute(command).await
    }
}

#[async_trait]
impl<E: CommandExecutor> Lrms for BatchLrms<E> {
    fn descriptor(&self) -> ResourceDescriptor {
        self.config.descriptor.clone()
    }

    async fn submit(&self, app: &Application) -> Result<JobHandle, LrmsError> {
        let out = self.run(&self.qsub_command(app)).await?;
        if !out.success() {
            return Err(classify_failure("qsub", &out));
        }
        let lrms_job_id = parse_qsub_job_id(&out.stdout).ok_or_else(|| {
            LrmsError::Failed(format!("cannot find job id in qsub output: {}", out.stdout.trim()))
        })?;
        Ok(JobHandle {
            resource: self.config.descriptor.name.clone(),
            lrms_job_id,
            submitted_at: self.clock.now(),
        })
    }

    async fn check_status(&self, job: &JobHandle) -> Result<JobStatus, LrmsError> {
        let out = self.run("qstat").await?;
        if !out.success() {
            return Err(classify_failure("qstat", &out));
        }
        if let Some(code) = qstat_state_of(&out.stdout, &job.lrms_job_id) {
            return Ok(parse_qstat_state(code));
        }

        // 終了したジョブは qstat から消えるので accounting を見る
        let acct = self
            .run(&format!("qacct -j {}", sh_quote(&job.lrms_job_id)))
            .await?;
        if !acct.success() {
            // accounting への反映は遅れることがある
            return Err(LrmsError::Transient(format!(
                "job {} is neither in qstat nor in qacct yet",
                job.lrms_job_id
            )));
        }
        match parse_qacct_exit(&acct.stdout) {
            Some(0) => Ok(JobStatus::Finished),
            Some(_) => Ok(JobStatus::Failed),
            None => Err(LrmsError::Failed(format!(
                "no exit_status in qacct output for job {}",
                job.lrms_job_id
            ))),
        }
    }

    async fn get_results(&self, job: &JobHandle) -> Result<Vec<Artifact>, LrmsError> {
        let spool = &self.config.spool_dir;
        let out = self.run(&format!("ls -1 {}", sh_quote(spool))).await?;
        if !out.success() {
            return Err(classify_failure("ls", &out));
        }
        let stdout_suffix = format!(".o{}", job.lrms_job_id);
        let stderr_suffix = format!(".e{}", job.lrms_job_id);
        let artifacts: Vec<Artifact> = out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|name| name.ends_with(&stdout_suffix) || name.ends_with(&stderr_suffix))
            .map(|name| Artifact::FilePath(format!("{}/{name}", spool.trim_end_matches('/'))))
            .collect();
        if artifacts.is_empty() {
            warn!(job = %job, spool = %spool, "no output files found for job");
        }
        Ok(artifacts)
    }

    async fn cancel(&self, job: &JobHandle) -> Result<(), LrmsError> {
        let out = self
            .run(&format!("qdel {}", sh_quote(&job.lrms_job_id)))
            .await?;
        if out.success() {
            return Ok(());
        }
        if out.stderr.contains("does not exist") {
            return Err(LrmsError::UnknownJob(job.lrms_job_id.clone()));
        }
        Err(classify_failure("qdel", &out))
    }

    async fn get_resource_status(&self, user: &str) -> Result<ResourceStatus, LrmsError> {
        let jobs = self.run("qstat -u '*'").await?;
        if !jobs.success() {
            return Err(classify_failure("qstat", &jobs));
        }
        let queues = self.run("qstat -g c").await?;
        if !queues.success() {
            return Err(classify_failure("qstat -g c", &queues));
        }
        let counts = count_jobs(&jobs.stdout, user);
        Ok(ResourceStatus {
            free_slots: parse_free_slots(&queues.stdout),
            total_queued: counts.total_queued,
            total_running: counts.total_running,
            user_queued: counts.user_queued,
            user_running: counts.user_running,
        })
    }
}

fn classify_failure(command: &str, out: &CommandOutput) -> LrmsError {
    let detail = format!("`{command}` exited {}: {}", out.exit_code, out.stderr.trim());
    let lower = out.stderr.to_lowercase();
    if lower.contains("permission denied") || lower.contains("authentication") {
        LrmsError::Authentication(detail)
    } else if command == "qsub" {
        LrmsError::Rejected(detail)
    } else {
        LrmsError::Failed(detail)
    }
}

/// SGE job names may not contain whitespace or `/`.
fn job_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_whitespace() || c == '/' { '_' } else { c })
        .collect();
    if cleaned.is_empty() {
        "bobbin".into()
    } else {
        cleaned
    }
}

/// Single-quote for `/bin/sh`.
fn sh_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// `Your job 123 ("name") has been submitted`
fn parse_qsub_job_id(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("Your job ")?;
        let id: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        (!id.is_empty()).then_some(id)
    })
}

/// State column of `job_id` in plain `qstat` output.
fn qstat_state_of<'a>(stdout: &'a str, job_id: &str) -> Option<&'a str> {
    stdout.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [id, _prio, _name, _user, state, ..] if *id == job_id => Some(*state),
            _ => None,
        }
    })
}

fn parse_qstat_state(code: &str) -> JobStatus {
    if code.contains('E') {
        JobStatus::Failed
    } else if code.starts_with('h') || code.contains(['s', 'S', 'T']) {
        // held by a user or administrator, or suspended
        JobStatus::Stopped
    } else if code.contains('d') {
        JobStatus::Deleted
    } else if code.contains('r') || code.contains('R') || code.contains('t') {
        JobStatus::Running
    } else if code.contains("qw") {
        JobStatus::Submitted
    } else {
        warn!(code, "unknown qstat state");
        JobStatus::Unknown
    }
}

/// `exit_status` of `qacct -j`, treating a non-zero `failed` as failure.
fn parse_qacct_exit(stdout: &str) -> Option<i32> {
    let mut exit_status = None;
    let mut failed = 0;
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() || line.contains("===") {
            continue;
        }
        let Some((key, value)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        let value = value.trim().split_whitespace().next().unwrap_or_default();
        match key {
            "exit_status" => exit_status = value.parse::<i32>().ok(),
            "failed" => failed = value.parse::<i32>().unwrap_or(0),
            _ => {}
        }
    }
    exit_status.map(|code| if failed != 0 && code == 0 { failed } else { code })
}

#[derive(Debug, Default, PartialEq, Eq)]
struct JobCounts {
    total_running: u32,
    total_queued: u32,
    user_running: u32,
    user_queued: u32,
}

/// Counts from `qstat -u '*'`. Jobs in error, hold, suspended or deleted
/// state are ignored.
fn count_jobs(stdout: &str, user: &str) -> JobCounts {
    let mut counts = JobCounts::default();
    for line in stdout.lines().skip(2) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [_id, _prio, _name, owner, state, ..] = fields.as_slice() else {
            continue;
        };
        if state.contains(['E', 'h', 'T', 's', 'S', 'd']) {
            continue;
        }
        let own = *owner == user;
        if state.contains('q') {
            counts.total_queued += 1;
            if own {
                counts.user_queued += 1;
            }
        }
        if state.contains('r') {
            counts.total_running += 1;
            if own {
                counts.user_running += 1;
            }
        }
    }
    counts
}

/// Sum of the AVAIL column of `qstat -g c`.
fn parse_free_slots(stdout: &str) -> u32 {
    stdout
        .lines()
        .skip(2)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            fields.get(4).and_then(|v| v.parse::<u32>().ok())
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Mutex;

    const QSTAT: &str = "\
job-ID  prior   name       user         state submit/start at     queue                          slots ja-task-ID
-----------------------------------------------------------------------------------------------------------------
    101 0.55500 sim        alice        r     01/01/2024 12:00:00 all.q@node1                        1
    102 0.55500 sim        alice        qw    01/01/2024 12:00:01                                    1
    103 0.55500 other      bob          r     01/01/2024 12:00:02 all.q@node2                        1
    104 0.55500 other      bob          Eqw   01/01/2024 12:00:03                                    1
    105 0.55500 other      bob          hqw   01/01/2024 12:00:04                                    1
    106 0.55500 other      bob          s     01/01/2024 12:00:05 all.q@node2                        1
    107 0.55500 other      bob          S     01/01/2024 12:00:06 all.q@node3                        1
";

    const QSTAT_GC: &str = "\
CLUSTER QUEUE                   CQLOAD   USED    RES  AVAIL  TOTAL aoACDS  cdsuE
--------------------------------------------------------------------------------
all.q                             0.01      2      0     14     16      0      0
long.q                            0.00      0      0      3      4      0      1
";

    /// コマンドの先頭一致で固定の出力を返す
    #[derive(Default)]
    struct ScriptedExecutor {
        replies: Vec<(String, CommandOutput)>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedExecutor {
        fn reply(mut self, prefix: &str, exit_code: i32, stdout: &str, stderr: &str) -> Self {
            self.replies.push((
                prefix.to_string(),
                CommandOutput {
                    exit_code,
                    stdout: stdout.into(),
                    stderr: stderr.into(),
                },
            ));
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandExecutor for ScriptedExecutor {
        async fn execute(&self, command: &str) -> Result<CommandOutput, LrmsError> {
            self.calls.lock().unwrap().push(command.to_string());
            self.replies
                .iter()
                .find(|(prefix, _)| command.starts_with(prefix.as_str()))
                .map(|(_, out)| out.clone())
                .ok_or_else(|| LrmsError::Failed(format!("unscripted command: {command}")))
        }
    }

    fn config() -> BatchConfig {
        BatchConfig {
            descriptor: ResourceDescriptor {
                name: "sge".into(),
                max_cores_per_job: Some(16),
                max_memory_per_core: Some(4096),
                max_walltime: Some(86400),
            },
            spool_dir: "/home/alice/spool".into(),
            parallel_environment: Some("smp".into()),
        }
    }

    fn handle(id: &str) -> JobHandle {
        JobHandle {
            resource: "sge".into(),
            lrms_job_id: id.into(),
            submitted_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn submit_parses_job_id_and_builds_qsub_line() {
        let exec = ScriptedExecutor::default().reply(
            "qsub",
            0,
            "Your job 4711 (\"fit_1\") has been submitted\n",
            "",
        );
        let lrms = BatchLrms::new(exec, config());
        let app = Application::new("fit 1", "/usr/bin/fit")
            .with_args(["--in", "a b.dat"])
            .with_cores(4)
            .with_memory(1024)
            .with_walltime(600);

        let job = lrms.submit(&app).await.unwrap();
        assert_eq!(job.lrms_job_id, "4711");
        assert_eq!(job.resource, "sge");

        let calls = lrms.executor.calls();
        assert_eq!(
            calls[0],
            "qsub -N fit_1 -o /home/alice/spool -e /home/alice/spool -l h_rt=600 -l h_vmem=1024M -pe smp 4 -b y /usr/bin/fit --in 'a b.dat'"
        );
    }

    #[rstest]
    #[case::denied("Permission denied (publickey)", true)]
    #[case::quota("job rejected: quota exceeded", false)]
    #[tokio::test]
    async fn submit_failures_are_classified(#[case] stderr: &str, #[case] auth: bool) {
        let exec = ScriptedExecutor::default().reply("qsub", 1, "", stderr);
        let lrms = BatchLrms::new(exec, config());

        let err = lrms.submit(&Application::new("a", "true")).await.unwrap_err();
        if auth {
            assert!(matches!(err, LrmsError::Authentication(_)));
        } else {
            assert!(matches!(err, LrmsError::Rejected(_)));
        }
    }

    #[rstest]
    #[case::running("101", JobStatus::Running)]
    #[case::queued("102", JobStatus::Submitted)]
    #[case::error("104", JobStatus::Failed)]
    #[case::held("105", JobStatus::Stopped)]
    #[case::suspended("106", JobStatus::Stopped)]
    #[case::queue_suspended("107", JobStatus::Stopped)]
    #[tokio::test]
    async fn status_from_qstat(#[case] id: &str, #[case] expected: JobStatus) {
        let exec = ScriptedExecutor::default().reply("qstat", 0, QSTAT, "");
        let lrms = BatchLrms::new(exec, config());
        assert_eq!(lrms.check_status(&handle(id)).await.unwrap(), expected);
    }

    #[rstest]
    #[case::ok("exit_status  0\nfailed       0\n", JobStatus::Finished)]
    #[case::nonzero("exit_status  137\nfailed       0\n", JobStatus::Failed)]
    #[case::failed_flag("failed       100 : assumedly after job\nexit_status  0\n", JobStatus::Failed)]
    #[tokio::test]
    async fn finished_jobs_fall_back_to_qacct(#[case] acct: &str, #[case] expected: JobStatus) {
        let exec = ScriptedExecutor::default()
            .reply("qstat", 0, QSTAT, "")
            .reply(
                "qacct -j 200",
                0,
                &format!("==============================================================\nqname        all.q\n{acct}"),
                "",
            );
        let lrms = BatchLrms::new(exec, config());

        assert_eq!(lrms.check_status(&handle("200")).await.unwrap(), expected);
        assert_eq!(lrms.executor.calls(), vec!["qstat", "qacct -j 200"]);
    }

    #[tokio::test]
    async fn missing_accounting_is_transient() {
        let exec = ScriptedExecutor::default()
            .reply("qstat", 0, QSTAT, "")
            .reply("qacct", 1, "", "error: job id 200 not found");
        let lrms = BatchLrms::new(exec, config());

        let err = lrms.check_status(&handle("200")).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn results_are_spool_files_of_the_job() {
        let exec = ScriptedExecutor::default().reply(
            "ls -1",
            0,
            "fit_1.o4711\nfit_1.e4711\nfit_2.o4712\nnotes.txt\n",
            "",
        );
        let lrms = BatchLrms::new(exec, config());

        let results = lrms.get_results(&handle("4711")).await.unwrap();
        assert_eq!(
            results,
            vec![
                Artifact::FilePath("/home/alice/spool/fit_1.o4711".into()),
                Artifact::FilePath("/home/alice/spool/fit_1.e4711".into()),
            ]
        );
    }

    #[tokio::test]
    async fn cancel_of_unknown_job() {
        let exec = ScriptedExecutor::default().reply(
            "qdel",
            1,
            "",
            "denied: job \"999\" does not exist",
        );
        let lrms = BatchLrms::new(exec, config());
        assert!(matches!(
            lrms.cancel(&handle("999")).await,
            Err(LrmsError::UnknownJob(_))
        ));
    }

    #[tokio::test]
    async fn resource_status_combines_job_counts_and_slots() {
        let exec = ScriptedExecutor::default()
            .reply("qstat -u", 0, QSTAT, "")
            .reply("qstat -g c", 0, QSTAT_GC, "");
        let lrms = BatchLrms::new(exec, config());

        let status = lrms.get_resource_status("alice").await.unwrap();
        assert_eq!(
            status,
            ResourceStatus {
                free_slots: 17,
                total_queued: 1,
                total_running: 2,
                user_queued: 1,
                user_running: 1,
            }
        );
    }

    #[tokio::test]
    async fn held_job_keeps_single_job_waiting() {
        use crate::domain::{Application, StateName, Transition};
        use crate::ports::TaskStore;
        use crate::tasks::{SingleJob, SingleJobPayload};

        let exec = ScriptedExecutor::default()
            .reply("qstat -u", 0, QSTAT, "")
            .reply("qstat -g c", 0, QSTAT_GC, "")
            .reply("qsub", 0, "Your job 105 (\"hello\") has been submitted\n", "")
            .reply("qstat", 0, QSTAT, "");
        let engine = crate::EngineBuilder::new()
            .backend(Arc::new(BatchLrms::new(exec, config())) as Arc<dyn Lrms>)
            .config(crate::testing::Harness::config())
            .with_builtin_tasks()
            .unwrap()
            .build()
            .unwrap();

        let id = SingleJob::submit(&engine, Application::new("hello", "/bin/true"))
            .await
            .unwrap();
        engine.step(id).await.unwrap();
        engine.step(id).await.unwrap();
        engine.step(id).await.unwrap();

        let record = engine.store().load(id).await.unwrap();
        assert_eq!(record.state, StateName::new("WAITING"));
        assert_eq!(record.transition, Transition::Paused);
        assert_eq!(record.last_error, None);
        let payload: SingleJobPayload = serde_json::from_value(record.payload).unwrap();
        assert_eq!(payload.last_status, Some(JobStatus::Stopped));
    }

    #[test]
    fn quoting() {
        assert_eq!(sh_quote("plain-arg"), "plain-arg");
        assert_eq!(sh_quote("two words"), "'two words'");
        assert_eq!(sh_quote("it's"), r"'it'\''s'");
        assert_eq!(sh_quote(""), "''");
    }

    #[test]
    fn qsub_output_without_id() {
        assert_eq!(parse_qsub_job_id("Unable to run job"), None);
    }
}
