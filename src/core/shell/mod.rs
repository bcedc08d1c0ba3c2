//! Shell on a target console
//!
//! Runs commands by typing them on a console and waiting for the shell
//! prompt. When fixups are loaded (see [`fixup`]), typed commands are
//! verified against their echo and resumed if a known message
//! interrupted them.

pub mod fixup;

pub use fixup::{EchoWaiter, FixupWatcher, ECHO_CONTEXT};

use super::context::WaitContext;
use super::error::{Attachment, Behavior, ExpectError, Verdict};
use super::expectation::{Expectation, Match};
use super::expecter::ExpectationRef;
use super::pattern::Pattern;
use super::poll::PollState;
use super::target::Target;
use super::testcase::{Testcase, HASH_ID_LEN};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Prompts of common shells: ANSI colored `SOMETHING $ `, Fedora style
/// `user@host$ ` and SLES/ACRN style `host:path>`
const SHELL_PROMPTS: [&str; 3] = [
    r"[-/@_~: \x1b=;\[0-9A-Za-z]+ [\x1b=;\[0-9A-Za-z]*[#\$][\x1b=;\[0-9A-Za-z]* ",
    r"[^@]+@.*[#\$] ",
    r"[^:]+:.*[#\$>]",
];

const SHELL_ERROR_CONTEXT: &str = "shell-error";
const COMMAND_NOT_FOUND_CONTEXT: &str = "shell-command-not-found";
const LOGIN_ERROR_CONTEXT: &str = "shell-login-error";

/// Prompt matched when nothing more specific was set
pub fn default_prompt() -> Result<Pattern, ExpectError> {
    Pattern::regex(&format!(
        "(TCF-[0-9a-zA-Z]{{{}}})?({})",
        HASH_ID_LEN,
        SHELL_PROMPTS.join("|")
    ))
}

/// How to run a command
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Output to find before the prompt, in order
    pub expect: Vec<Pattern>,
    /// Prompt to wait for instead of the shell's
    pub prompt: Option<Pattern>,
    /// Return the console output of the command
    pub output: bool,
    /// Turn `\r\n` into `\n` in the returned output
    pub filter_crlf: bool,
    /// Drop the first (command echo) and last (prompt) lines of the
    /// returned output
    pub trim: bool,
    /// Timeout for each wait; the configured default if unset
    pub timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            expect: Vec::new(),
            prompt: None,
            output: false,
            filter_crlf: true,
            trim: false,
            timeout: None,
        }
    }
}

impl RunOptions {
    /// Defaults: wait for the prompt only
    pub fn new() -> Self {
        Self::default()
    }

    /// Also wait for `pattern` before the prompt
    #[must_use]
    pub fn with_expect(mut self, pattern: Pattern) -> Self {
        self.expect.push(pattern);
        self
    }

    /// Wait for this prompt instead
    #[must_use]
    pub fn with_prompt(mut self, prompt: Pattern) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Collect the output, optionally trimmed
    #[must_use]
    pub fn with_output(mut self, trim: bool) -> Self {
        self.output = true;
        self.trim = trim;
        self
    }

    /// Keep `\r\n` in the output
    #[must_use]
    pub fn keep_crlf(mut self) -> Self {
        self.filter_crlf = false;
        self
    }

    /// Timeout for each wait
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What a command run produced
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    /// Matches of [`RunOptions::expect`], in order
    pub matches: Vec<Match>,
    /// The prompt that ended the command
    pub prompt: Option<Match>,
    /// Console output, if requested
    pub output: Option<String>,
}

/// How to bring a shell up
#[derive(Debug, Clone)]
pub struct UpOptions {
    /// User to log in as when a login prompt shows up
    pub user: Option<String>,
    /// Password, sent when the password prompt shows up
    pub password: Option<String>,
    /// Login prompt
    pub login_prompt: Pattern,
    /// Password prompt
    pub password_prompt: Pattern,
    /// Text sent before each attempt to wake the console up
    pub tempt: Option<String>,
    /// Attempts after the first one
    pub retries: u32,
    /// Timeout of each wait; the configured default if unset
    pub timeout: Option<Duration>,
    /// Run [`Shell::setup`] once the prompt is seen
    pub setup: bool,
}

impl Default for UpOptions {
    fn default() -> Self {
        Self {
            user: None,
            password: None,
            login_prompt: Pattern::literal("login:"),
            password_prompt: Pattern::literal("assword:"),
            tempt: None,
            retries: 2,
            timeout: None,
            setup: true,
        }
    }
}

impl UpOptions {
    /// Defaults: no login, two retries, shell setup
    pub fn new() -> Self {
        Self::default()
    }

    /// Log in as `user`, with `password` if given
    #[must_use]
    pub fn with_login(mut self, user: &str, password: Option<&str>) -> Self {
        self.user = Some(user.to_string());
        self.password = password.map(str::to_string);
        self
    }

    /// Send `text` before waiting
    #[must_use]
    pub fn with_tempt(mut self, text: &str) -> Self {
        self.tempt = Some(text.to_string());
        self
    }

    /// Attempts after the first
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Timeout of each wait
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Leave the shell as found
    #[must_use]
    pub fn without_setup(mut self) -> Self {
        self.setup = false;
        self
    }
}

#[derive(Debug)]
struct SavedContext {
    name: String,
    prompt: Pattern,
    fixups: Vec<Arc<FixupWatcher>>,
}

/// A shell on one console of a target
#[derive(Debug)]
pub struct Shell {
    testcase: Testcase,
    target: Arc<Target>,
    state: Arc<PollState>,
    prompt: Pattern,
    fixups: Vec<Arc<FixupWatcher>>,
    contexts: Vec<SavedContext>,
}

impl Shell {
    /// Shell on `console` (default console if `None`) of `target`
    pub fn new(
        testcase: Testcase,
        target: Arc<Target>,
        console: Option<&str>,
    ) -> Result<Self, ExpectError> {
        let state = testcase.console(&target, console);
        Ok(Self {
            testcase,
            target,
            state,
            prompt: default_prompt()?,
            fixups: Vec::new(),
            contexts: Vec::new(),
        })
    }

    /// Console the shell runs on
    pub fn console(&self) -> &str {
        self.state.console()
    }

    /// Prompt waited for after each command
    pub fn prompt(&self) -> &Pattern {
        &self.prompt
    }

    /// Change the prompt
    pub fn set_prompt(&mut self, prompt: Pattern) {
        self.prompt = prompt;
    }

    /// Innermost shell context, if any
    pub fn context_name(&self) -> Option<&str> {
        self.contexts.last().map(|c| c.name.as_str())
    }

    /// Names of the active fixups
    pub fn fixup_names(&self) -> Vec<&str> {
        self.fixups.iter().map(|f| f.name()).collect()
    }

    /// Enter a shell context
    ///
    /// The current prompt and fixups are saved; the fixups configured
    /// for `name` (`shell.fixups.NAME`) replace them until
    /// [`Shell::pop_context`].
    pub fn push_context(&mut self, name: &str) -> Result<(), ExpectError> {
        let config = self.testcase.config();
        let mut fixups = Vec::new();
        if let Some(configured) = config.shell.fixups.get(name) {
            for (fixup, regex) in configured {
                fixups.push(Arc::new(self.fixup(fixup, regex)?));
            }
        }
        tracing::debug!(
            "{}: entering shell context {} with {} fixups",
            self.target.full_id(),
            name,
            fixups.len()
        );
        let saved = std::mem::replace(&mut self.fixups, fixups);
        self.contexts.push(SavedContext {
            name: name.to_string(),
            prompt: self.prompt.clone(),
            fixups: saved,
        });
        Ok(())
    }

    /// Leave the innermost shell context, restoring its prompt and
    /// fixups; returns its name
    pub fn pop_context(&mut self) -> Option<String> {
        let saved = self.contexts.pop()?;
        self.prompt = saved.prompt;
        self.fixups = saved.fixups;
        Some(saved.name)
    }

    /// Add a fixup to the current context
    pub fn add_fixup(&mut self, name: &str, regex: &str) -> Result<(), ExpectError> {
        let fixup = self.fixup(name, regex)?;
        self.fixups.retain(|f| f.name() != name);
        self.fixups.push(Arc::new(fixup));
        Ok(())
    }

    fn fixup(&self, name: &str, regex: &str) -> Result<FixupWatcher, ExpectError> {
        FixupWatcher::new(
            self.state.clone(),
            name,
            regex,
            self.testcase.config().expect.poll_period(),
            self.testcase.recovered().clone(),
        )
    }

    fn expectation(&self, pattern: Pattern, name: &str, timeout: Duration) -> ExpectationRef {
        Arc::new(
            self.testcase
                .text(&self.target, Some(self.console()), pattern)
                .with_name(name)
                .with_detect_context(self.console())
                .with_timeout(timeout),
        )
    }

    /// Wait for `pattern` on the shell's console
    ///
    /// Global watchers that return instead of raising do not end the
    /// wait; it goes on until `pattern` shows up or `timeout` elapses.
    async fn wait_for(
        &self,
        ctx: &WaitContext,
        pattern: &Pattern,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<Match>, ExpectError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline
                .saturating_duration_since(Instant::now())
                .max(Duration::from_millis(1));
            let expectation = self.expectation(pattern.clone(), name, remaining);
            match self.testcase.expect(ctx, &[expectation]).await? {
                Some(found) if found.global => {
                    tracing::debug!(
                        "{}: {} found while waiting for {}",
                        ctx.prefix(),
                        found.name,
                        name
                    );
                }
                found => return Ok(found.map(|found| found.matched)),
            }
        }
    }

    /// Wait for the shell to come up on the console
    ///
    /// Resets the prompt to the default one, logs in if a user is given
    /// and waits for the prompt. Attempts that time out are retried,
    /// nudging the console with blank lines; "Login incorrect" is an
    /// error right away. Runs [`Shell::setup`] afterwards unless told
    /// not to.
    pub async fn up(&mut self, ctx: &WaitContext, opts: &UpOptions) -> Result<(), ExpectError> {
        let ctx = ctx.child(&format!("shell-up/{}", self.console()));
        let timeout = opts
            .timeout
            .unwrap_or_else(|| self.testcase.config().expect.timeout());
        self.prompt = default_prompt()?;

        let login_error = format!("{}:{}: login error", self.target.role(), self.console());
        self.watch(
            LOGIN_ERROR_CONTEXT,
            &login_error,
            Pattern::literal("Login incorrect"),
        );
        let result = self.wait_up(&ctx, opts, timeout).await;
        self.testcase.expect_global_remove(&login_error);
        result?;

        if opts.setup {
            self.setup(&ctx).await?;
        }
        Ok(())
    }

    async fn wait_up(
        &self,
        ctx: &WaitContext,
        opts: &UpOptions,
        timeout: Duration,
    ) -> Result<(), ExpectError> {
        let console = self.console().to_string();
        let start = Instant::now();
        let mut logged_in = false;
        for attempt in 0..=opts.retries {
            let outcome = async {
                if let Some(tempt) = &opts.tempt {
                    self.target.send(&console, tempt).await?;
                }
                if let (Some(user), false) = (&opts.user, logged_in) {
                    self.wait_for(ctx, &opts.login_prompt, "login prompt", timeout)
                        .await?;
                    self.target.send(&console, user).await?;
                    if let Some(password) = &opts.password {
                        self.wait_for(ctx, &opts.password_prompt, "password prompt", timeout)
                            .await?;
                        self.target.send(&console, password).await?;
                    }
                    logged_in = true;
                }
                self.wait_for(ctx, &self.prompt, "early shell prompt", timeout)
                    .await
            }
            .await;

            match outcome {
                Ok(_) => {
                    tracing::info!(
                        "{}: shell up after {:.1}s",
                        ctx.prefix(),
                        start.elapsed().as_secs_f64()
                    );
                    return Ok(());
                }
                Err(err) if err.is_failed() && attempt < opts.retries => {
                    tracing::info!(
                        "{}: attempt {} failed at +{:.1}s, retrying: {}",
                        ctx.prefix(),
                        attempt + 1,
                        start.elapsed().as_secs_f64(),
                        err
                    );
                    if opts.user.is_some() {
                        // clear whatever is half typed on the command line
                        self.target.write(&console, b"\r\n").await?;
                        self.target.write(&console, b"\r\n").await?;
                    }
                }
                Err(err) if err.is_failed() => {
                    return Err(ExpectError::raised(
                        Verdict::Error,
                        format!(
                            "{}: waited too long ({:.1}s) for the shell to come up on console {} \
                             (did not receive `{}`)",
                            ctx.prefix(),
                            start.elapsed().as_secs_f64(),
                            console,
                            self.prompt
                        ),
                        err.attachment().cloned().unwrap_or(Attachment::None),
                    ));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Set the shell up for scripting
    ///
    /// Sets a prompt unique to this test case, disables line editing,
    /// makes failing commands print `ERROR-IN-SHELL` and registers
    /// watchers raising an error when that or a "command not found"
    /// message shows up.
    pub async fn setup(&mut self, ctx: &WaitContext) -> Result<(), ExpectError> {
        let hash_id = self.testcase.hash_id().to_string();
        self.prompt = Pattern::regex(&format!(r"TCF-{hash_id}:.+ %% [\$#] "))?;
        let opts = RunOptions::default();
        self.run(
            ctx,
            Some(&format!(r#"export PS1="TCF-{hash_id}:\w %% \$ ""#)),
            &opts,
        )
        .await?;
        self.run(ctx, Some(r#"test ! -z "$BASH" && set +o vi +o emacs"#), &opts)
            .await?;
        // split so the echo of this command does not trip the watcher
        self.run(ctx, Some("trap 'echo ERROR''-IN-SHELL' ERR"), &opts)
            .await?;

        let id = format!("{}:{}", self.target.role(), self.console());
        self.watch(
            SHELL_ERROR_CONTEXT,
            &format!("{id}: shell error"),
            Pattern::literal("ERROR-IN-SHELL"),
        );
        self.watch(
            COMMAND_NOT_FOUND_CONTEXT,
            &format!("{id}: command not available"),
            Pattern::regex(r"bash: .*: command not found\.\.\.")?,
        );
        Ok(())
    }

    fn watch(&self, detect_context: &str, name: &str, pattern: Pattern) {
        self.state.sync_to_end(detect_context);
        let watcher = self
            .testcase
            .text(&self.target, Some(self.console()), pattern)
            .with_name(name)
            .with_detect_context(detect_context)
            .with_timeout(Duration::ZERO)
            .with_poll_period(Duration::from_secs(1))
            .when_found(Behavior::Raise(Verdict::Error));
        self.testcase.expect_global_append(Arc::new(watcher), true);
    }

    /// Run `cmd` and wait for the prompt
    ///
    /// Without a command only the expectations and the prompt are
    /// waited for. The command's own exit status is not checked here;
    /// after [`Shell::setup`] failing commands are caught by the shell
    /// error watcher.
    pub async fn run(
        &self,
        ctx: &WaitContext,
        cmd: Option<&str>,
        opts: &RunOptions,
    ) -> Result<RunOutput, ExpectError> {
        let ctx = ctx.child(&format!("shell/{}", self.console()));
        let settings = &self.testcase.config().expect;
        let timeout = opts.timeout.unwrap_or_else(|| settings.timeout());
        if timeout.is_zero() {
            return Err(ExpectError::Invalid(format!(
                "{}: timeout must be > 0",
                ctx.prefix()
            )));
        }
        let console = self.console().to_string();

        let start = match cmd {
            Some(cmd) => {
                // only look at what the command produces
                self.state.poll(&ctx, settings.lookback_bytes).await?;
                let start = self.state.sync_to_end(&console).offset;
                self.state.sync_to_end(ECHO_CONTEXT);
                for fixup in &self.fixups {
                    self.state.sync_to_end(fixup.detect_context());
                }
                if self.fixups.is_empty() {
                    self.target.send(&console, cmd).await?;
                } else {
                    self.type_command(&ctx, cmd).await?;
                }
                tracing::info!("{}: sent command: {}", ctx.prefix(), cmd);
                start
            }
            None => self.state.cursor(&console).offset,
        };

        let mut result = RunOutput::default();
        for pattern in &opts.expect {
            if let Some(found) = self.wait_for(&ctx, pattern, "command output", timeout).await? {
                result.matches.push(found);
            }
        }
        let prompt = opts.prompt.as_ref().unwrap_or(&self.prompt);
        result.prompt = self.wait_for(&ctx, prompt, "shell prompt", timeout).await?;

        if opts.output {
            let end = result
                .prompt
                .as_ref()
                .map_or_else(|| self.state.captured_len(), |m| m.offset_match_end);
            let raw = self.state.read_range(start, end)?;
            result.output = Some(format_output(&raw, opts.filter_crlf, opts.trim));
        }
        Ok(result)
    }

    /// Type a command, verifying its echo and resuming it when a fixup
    /// interrupts it
    async fn type_command(&self, ctx: &WaitContext, cmd: &str) -> Result<(), ExpectError> {
        let console = self.console();
        let crlf = self.target.console_settings(console).crlf().to_string();
        let config = self.testcase.config();
        let mut pending = cmd.to_string();
        let mut send = true;
        loop {
            if send {
                let line = format!("{pending}{crlf}");
                self.target.write(console, line.as_bytes()).await?;
            }
            let mut waiting: Vec<ExpectationRef> = vec![Arc::new(EchoWaiter::new(
                self.state.clone(),
                &pending,
                config.shell.echo_timeout(),
                config.expect.poll_period(),
            ))];
            waiting.extend(self.fixups.iter().map(|f| f.clone() as ExpectationRef));

            let Some(found) = self.testcase.expect(ctx, &waiting).await? else {
                return Err(ExpectError::blocked(format!(
                    "{}: echo of `{}` never seen",
                    ctx.prefix(),
                    pending
                )));
            };
            if found.global {
                tracing::debug!(
                    "{}: {} found while typing, still waiting for echo",
                    ctx.prefix(),
                    found.name
                );
                send = false;
                continue;
            }
            if found.index == 0 {
                return Ok(());
            }

            match self.resume(&pending, &found.matched)? {
                Some(rest) => {
                    tracing::info!(
                        "{}: resuming command interrupted by {}; sending: {}",
                        ctx.prefix(),
                        found.name,
                        rest
                    );
                    pending = rest;
                    send = true;
                }
                None => return Ok(()),
            }
        }
    }

    /// Part of `pending` still to be typed after a fixup matched;
    /// `None` if the whole command was echoed
    fn resume(&self, pending: &str, fixup: &Match) -> Result<Option<String>, ExpectError> {
        let echo = self.state.cursor(ECHO_CONTEXT);
        let before = if fixup.offset_match_start > echo.offset {
            self.state.read_range(echo.offset, fixup.offset_match_start)?
        } else {
            Vec::new()
        };
        let after = self
            .state
            .read_range(fixup.offset_match_end, self.state.captured_len())?;
        let point = fixup::resume_point(&before, &after, pending);
        self.state.advance_cursor(
            ECHO_CONTEXT,
            fixup.offset_match_end + point.after_consumed as u64,
        );
        let rest = &pending[point.echoed..];
        Ok((!rest.is_empty()).then(|| rest.to_string()))
    }
}

fn format_output(raw: &[u8], filter_crlf: bool, trim: bool) -> String {
    let mut output = String::from_utf8_lossy(raw).into_owned();
    if filter_crlf {
        output = output.replace("\r\n", "\n");
    }
    if trim {
        output = match (output.find('\n'), output.rfind('\n')) {
            (Some(first), Some(last)) => output[first + 1..last + 1].to_string(),
            _ => String::new(),
        };
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::core::simulator::{MatchCondition, ResponseAction, ResponseRule, SimulatedConsole};

    fn setup(dir: &std::path::Path) -> (Testcase, Arc<SimulatedConsole>, Arc<Target>) {
        let mut config = AppConfig {
            capture_dir: Some(dir.to_path_buf()),
            ..AppConfig::default()
        };
        config.expect.poll_period_ms = 10;
        config.expect.timeout_ms = 2000;
        config.shell.echo_timeout_ms = 1000;
        config
            .shell
            .fixups
            .entry("booted".to_string())
            .or_default()
            .insert("kmsg".to_string(), r"\[ *[0-9]+\.[0-9]+\] [^\n]*".to_string());
        let tc = Testcase::new("tc", config).unwrap();
        let sim = Arc::new(SimulatedConsole::new(&["serial0"]));
        let target = tc.target("target", "qemu0", "serial0", sim.clone());
        (tc, sim, target)
    }

    fn answer(prompt: &str) -> ResponseRule {
        ResponseRule {
            name: "echo+prompt".to_string(),
            condition: MatchCondition::Any,
            action: ResponseAction::Sequence(vec![
                ResponseAction::Echo,
                ResponseAction::SendText {
                    text: prompt.to_string(),
                },
            ]),
            one_shot: false,
            match_count: 0,
        }
    }

    #[test]
    fn test_default_prompt() {
        let prompt = default_prompt().unwrap();
        assert!(prompt.find(b"root@localhost:~# ").is_some());
        assert!(prompt.find(b"TCF-abc123:/tmp %% $ ").is_some());
        assert!(prompt.find(b"just some text").is_none());
    }

    #[test]
    fn test_format_output() {
        let raw = b"ls\r\nfile1\r\nfile2\r\nTCF-abc123:~ %% $ ";
        assert_eq!(format_output(raw, true, true), "file1\nfile2\n");
        assert_eq!(format_output(raw, false, false), String::from_utf8_lossy(raw));
        assert_eq!(format_output(b"no newline", true, true), "");
    }

    #[test]
    fn test_contexts_stack_fixups() {
        let dir = tempfile::tempdir().unwrap();
        let (tc, _sim, target) = setup(dir.path());
        let mut shell = tc.shell(&target, None).unwrap();
        assert!(shell.fixup_names().is_empty());

        shell.push_context("booted").unwrap();
        assert_eq!(shell.context_name(), Some("booted"));
        assert_eq!(shell.fixup_names(), vec!["kmsg"]);
        shell.add_fixup("usb", "usb [0-9-]+: reset").unwrap();
        shell.set_prompt(Pattern::literal("> "));

        assert_eq!(shell.pop_context().as_deref(), Some("booted"));
        assert!(shell.fixup_names().is_empty());
        assert_eq!(shell.prompt().to_string(), default_prompt().unwrap().to_string());
        assert_eq!(shell.pop_context(), None);

        assert!(matches!(
            shell.add_fixup("bad", "(unclosed"),
            Err(ExpectError::InvalidPattern { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_collects_output() {
        let dir = tempfile::tempdir().unwrap();
        let (tc, sim, target) = setup(dir.path());
        let ctx = tc.context();
        // respond with canned output instead of an echo
        sim.add_rule(
            "serial0",
            ResponseRule {
                name: "uname".to_string(),
                condition: MatchCondition::Prefix {
                    bytes: b"uname".to_vec(),
                },
                action: ResponseAction::SendText {
                    text: "uname -r\r\n6.1.0\r\nroot@qemu0:~# ".to_string(),
                },
                one_shot: false,
                match_count: 0,
            },
        );
        let shell = tc.shell(&target, None).unwrap();

        let out = shell
            .run(
                &ctx,
                Some("uname -r"),
                &RunOptions::new()
                    .with_expect(Pattern::regex(r"(?P<release>[0-9]+\.[0-9]+\.[0-9]+)").unwrap())
                    .with_output(true),
            )
            .await
            .unwrap();
        assert_eq!(out.matches[0].group("release").as_deref(), Some("6.1.0"));
        assert_eq!(out.output.as_deref(), Some("6.1.0\n"));
        assert_eq!(sim.writes("serial0"), vec![b"uname -r\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_setup_registers_watchers() {
        let dir = tempfile::tempdir().unwrap();
        let (tc, sim, target) = setup(dir.path());
        let ctx = tc.context();
        let prompt = format!("\nTCF-{}:~ %% $ ", tc.hash_id());
        sim.add_rule(
            "serial0",
            ResponseRule {
                name: "missing".to_string(),
                condition: MatchCondition::Prefix {
                    bytes: b"frobnicate".to_vec(),
                },
                action: ResponseAction::SendText {
                    text: format!("frobnicate\nbash: frobnicate: command not found...{prompt}"),
                },
                one_shot: false,
                match_count: 0,
            },
        );
        sim.add_rule("serial0", answer(&prompt));

        let mut shell = tc.shell(&target, None).unwrap();
        shell.setup(&ctx).await.unwrap();
        assert_eq!(sim.writes("serial0").len(), 3);
        assert_eq!(
            tc.expect_global_names(),
            vec![
                "target:serial0: shell error",
                "target:serial0: command not available"
            ]
        );

        shell.run(&ctx, Some("true"), &RunOptions::new()).await.unwrap();
        let err = shell
            .run(&ctx, Some("frobnicate"), &RunOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.verdict(), Some(Verdict::Error));
    }

    fn reply(name: &str, on: &[u8], text: &str, one_shot: bool) -> ResponseRule {
        ResponseRule {
            name: name.to_string(),
            condition: MatchCondition::Exact { bytes: on.to_vec() },
            action: ResponseAction::SendText {
                text: text.to_string(),
            },
            one_shot,
            match_count: 0,
        }
    }

    fn usb_reset_watcher(tc: &Testcase, target: &Arc<Target>) {
        let watcher = tc
            .text(target, None, Pattern::literal("usb 1-1: reset"))
            .with_name("usb reset")
            .with_detect_context("usb-reset")
            .with_timeout(Duration::ZERO);
        tc.expect_global_append(Arc::new(watcher), true);
    }

    #[tokio::test]
    async fn test_returning_global_is_not_the_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let (tc, sim, target) = setup(dir.path());
        usb_reset_watcher(&tc, &target);
        sim.add_rule(
            "serial0",
            reply("hang", b"sleep 100\n", "sleep 100\nusb 1-1: reset\n", false),
        );
        let shell = tc.shell(&target, None).unwrap();

        let start = Instant::now();
        let err = shell
            .run(
                &tc.context(),
                Some("sleep 100"),
                &RunOptions::new().with_timeout(Duration::from_millis(300)),
            )
            .await
            .unwrap_err();
        assert!(err.is_failed(), "{err}");
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_prompt_after_returning_global() {
        let dir = tempfile::tempdir().unwrap();
        let (tc, sim, target) = setup(dir.path());
        usb_reset_watcher(&tc, &target);
        sim.add_rule(
            "serial0",
            reply("true", b"true\n", "true\nusb 1-1: reset\nroot@qemu0:~# ", false),
        );
        let shell = tc.shell(&target, None).unwrap();

        let out = shell
            .run(&tc.context(), Some("true"), &RunOptions::new().with_output(true))
            .await
            .unwrap();
        let prompt = out.prompt.unwrap();
        let state = tc.console(&target, None);
        let text = state
            .read_range(prompt.offset_match_start, prompt.offset_match_end)
            .unwrap();
        assert!(String::from_utf8_lossy(&text).ends_with("root@qemu0:~# "));
        assert_eq!(out.output.as_deref(), Some("usb 1-1: reset\n"));
    }

    #[tokio::test]
    async fn test_up_logs_in_and_sets_up() {
        let dir = tempfile::tempdir().unwrap();
        let (tc, sim, target) = setup(dir.path());
        let prompt = format!("\nTCF-{}:~ %% $ ", tc.hash_id());
        sim.emit("serial0", b"\nqemu0 login: ");
        sim.add_rule("serial0", reply("user", b"root\n", "root\nPassword: ", true));
        sim.add_rule("serial0", reply("password", b"secret\n", "\nroot@qemu0:~# ", true));
        sim.add_rule("serial0", answer(&prompt));

        let mut shell = tc.shell(&target, None).unwrap();
        shell
            .up(&tc.context(), &UpOptions::new().with_login("root", Some("secret")))
            .await
            .unwrap();

        let writes = sim.writes("serial0");
        assert_eq!(writes.len(), 5);
        assert_eq!(writes[..2], [b"root\n".to_vec(), b"secret\n".to_vec()]);
        assert_eq!(
            tc.expect_global_names(),
            vec![
                "target:serial0: shell error",
                "target:serial0: command not available"
            ]
        );
        assert!(shell.prompt().to_string().contains(tc.hash_id()));
    }

    #[tokio::test]
    async fn test_up_retries_until_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let (tc, sim, target) = setup(dir.path());
        // first nudge goes unanswered
        sim.add_rule("serial0", reply("ignored", b"\n", "", true));
        sim.add_rule("serial0", reply("woken", b"\n", "root@qemu0:~# ", false));

        let mut shell = tc.shell(&target, None).unwrap();
        shell
            .up(
                &tc.context(),
                &UpOptions::new()
                    .with_tempt("")
                    .with_retries(1)
                    .with_timeout(Duration::from_millis(200))
                    .without_setup(),
            )
            .await
            .unwrap();
        assert_eq!(sim.writes("serial0"), vec![b"\n".to_vec(), b"\n".to_vec()]);
        assert!(tc.expect_global_names().is_empty());
    }

    #[tokio::test]
    async fn test_up_login_incorrect_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let (tc, sim, target) = setup(dir.path());
        sim.emit("serial0", b"qemu0 login: ");
        sim.add_rule("serial0", reply("user", b"root\n", "root\nPassword: ", false));
        sim.add_rule(
            "serial0",
            reply("password", b"bad\n", "\nLogin incorrect\nqemu0 login: ", false),
        );

        let mut shell = tc.shell(&target, None).unwrap();
        let err = shell
            .up(
                &tc.context(),
                &UpOptions::new()
                    .with_login("root", Some("bad"))
                    .with_retries(3)
                    .with_timeout(Duration::from_millis(500)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.verdict(), Some(Verdict::Error));
        assert_eq!(sim.writes("serial0").len(), 2);
        assert!(tc.expect_global_names().is_empty());
    }

    #[tokio::test]
    async fn test_up_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let (tc, sim, target) = setup(dir.path());

        let mut shell = tc.shell(&target, None).unwrap();
        let err = shell
            .up(
                &tc.context(),
                &UpOptions::new()
                    .with_retries(1)
                    .with_timeout(Duration::from_millis(100))
                    .without_setup(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.verdict(), Some(Verdict::Error));
        assert!(err.to_string().contains("waited too long"), "{err}");
        assert!(sim.writes("serial0").is_empty());
    }
}
