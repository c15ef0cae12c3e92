//! Tick loop: which collaborator runs when, and the Normal / HighSpeed /
//! Party state machine.

use std::time::{Duration, Instant};

use crate::{
    audio::BandSource,
    config::RefreshRate,
    context::{MonitorContext, SortKey, SystemStats},
    render::{RenderSnapshot, Renderer},
    telemetry::{KernelSnapshotSource, ProcessTelemetry, SnapshotSource},
    Result,
};

/// Intervals below this switch to split fast/slow cadences.
pub const HIGH_SPEED_THRESHOLD: Duration = Duration::from_millis(500);

/// Cadence of full stats and process refresh while in HighSpeed.
pub const SLOW_CADENCE: Duration = Duration::from_millis(500);

/// Normal mode polls input in slices this long.
pub const INPUT_SLICE: Duration = Duration::from_millis(20);

/// Upper bound on input polling per Normal tick.
pub const MAX_NORMAL_POLL: Duration = Duration::from_millis(100);

const MIN_POLL: Duration = Duration::from_millis(1);

pub const PARTY_UNAVAILABLE: &str = "Party mode unavailable";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    HighSpeed,
    Party,
}

/// Normal or HighSpeed, depending only on the active interval.
pub fn mode_for_interval(interval: Duration) -> Mode {
    if interval < HIGH_SPEED_THRESHOLD {
        Mode::HighSpeed
    } else {
        Mode::Normal
    }
}

/// Rows moved by one page key.
pub const PAGE_ROWS: i64 = 10;

/// User intent delivered by an [`InputSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetRefreshRate(RefreshRate),
    ToggleParty,
    SortBy(SortKey),
    /// Replaces the name filter. An empty string clears it.
    SetFilter(String),
    ScrollBy(i64),
    ScrollTop,
    ScrollBottom,
    Quit,
}

/// Resource-query collaborator. Failures leave the previous values in place.
pub trait SystemSampler {
    /// Per-core and total CPU usage only.
    fn sample_cpu(&mut self, stats: &mut SystemStats);

    /// Memory, swap, disk and network figures.
    fn sample_slow(&mut self, stats: &mut SystemStats);

    fn sample_full(&mut self, stats: &mut SystemStats) {
        self.sample_cpu(stats);
        self.sample_slow(stats);
    }
}

pub trait InputSource {
    /// Waits at most `timeout` for one command.
    fn poll(&mut self, timeout: Duration) -> Result<Option<Command>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CadenceState {
    pub mode: Mode,
    pub last_fast_update: Option<Instant>,
    pub last_slow_update: Option<Instant>,
    /// Rate to restore when leaving Party.
    pub saved_rate: Option<RefreshRate>,
}

impl CadenceState {
    fn new(rate: RefreshRate) -> Self {
        Self {
            mode: mode_for_interval(rate.interval()),
            last_fast_update: None,
            last_slow_update: None,
            saved_rate: None,
        }
    }

    fn force_resample(&mut self) {
        self.last_fast_update = None;
        self.last_slow_update = None;
    }
}

fn is_due(last: Option<Instant>, now: Instant, every: Duration) -> bool {
    last.map_or(true, |last| now.saturating_duration_since(last) >= every)
}

/// How long to wait for input after a tick, as `(slice, total)`.
pub fn input_budget(mode: Mode, interval: Duration) -> (Duration, Duration) {
    match mode {
        Mode::HighSpeed | Mode::Party => {
            let wait = (interval / 2).max(MIN_POLL);
            (wait, wait)
        }
        Mode::Normal => (INPUT_SLICE, (interval / 2).min(MAX_NORMAL_POLL)),
    }
}

pub struct SamplingScheduler<Y, B, S = KernelSnapshotSource> {
    telemetry: ProcessTelemetry<S>,
    sampler: Y,
    bands: B,
    state: CadenceState,
}

impl<Y, B, S> SamplingScheduler<Y, B, S>
where
    Y: SystemSampler,
    B: BandSource,
    S: SnapshotSource,
{
    pub fn new(
        telemetry: ProcessTelemetry<S>,
        sampler: Y,
        bands: B,
        context: &MonitorContext,
    ) -> Self {
        Self {
            telemetry,
            sampler,
            bands,
            state: CadenceState::new(context.rate),
        }
    }

    pub fn mode(&self) -> Mode {
        self.state.mode
    }

    pub fn state(&self) -> &CadenceState {
        &self.state
    }

    pub fn sampler(&self) -> &Y {
        &self.sampler
    }

    pub fn bands(&self) -> &B {
        &self.bands
    }

    /// Samples whatever is due at `now` and builds the frame to draw.
    pub fn tick(&mut self, context: &mut MonitorContext, now: Instant) -> RenderSnapshot {
        let interval = context.rate.interval();
        match self.state.mode {
            Mode::Party => {
                let bands = self.bands.magnitudes();
                return RenderSnapshot::from_bands(context, &bands);
            }
            Mode::Normal => {
                if is_due(self.state.last_fast_update, now, interval) {
                    self.sampler.sample_full(&mut context.stats);
                    self.refresh_processes(context);
                    self.state.last_fast_update = Some(now);
                    self.state.last_slow_update = Some(now);
                }
            }
            Mode::HighSpeed => {
                if is_due(self.state.last_fast_update, now, interval) {
                    self.sampler.sample_cpu(&mut context.stats);
                    self.state.last_fast_update = Some(now);
                }
                if is_due(self.state.last_slow_update, now, SLOW_CADENCE) {
                    self.sampler.sample_slow(&mut context.stats);
                    self.refresh_processes(context);
                    self.state.last_slow_update = Some(now);
                }
            }
        }
        RenderSnapshot::from_context(context, self.state.mode)
    }

    fn refresh_processes(&mut self, context: &mut MonitorContext) {
        match self.telemetry.refresh() {
            Ok(processes) => context.processes = processes,
            Err(err) => tracing::warn!(%err, "process refresh failed, keeping previous list"),
        }
    }

    pub fn handle(&mut self, context: &mut MonitorContext, command: Command) {
        match command {
            Command::Quit => context.running = false,
            Command::ToggleParty => self.toggle_party(context),
            Command::SetRefreshRate(rate) => self.set_rate(context, rate),
            Command::SortBy(key) => {
                context.view.sort_by(key);
                let status = format!("Sorted by {}", context.view.describe_sort());
                context.set_status(status);
            }
            Command::SetFilter(filter) => {
                context.view.set_filter(filter);
                let status = if context.view.filter.is_empty() {
                    "Filter cleared".to_string()
                } else {
                    format!("Filter: '{}'", context.view.filter)
                };
                context.set_status(status);
            }
            Command::ScrollBy(delta) => {
                let len = context.view.matching_count(&context.processes);
                context.view.scroll_by(delta, len);
            }
            Command::ScrollTop => context.view.scroll_top(),
            Command::ScrollBottom => {
                let len = context.view.matching_count(&context.processes);
                context.view.scroll_bottom(len);
            }
        }
    }

    fn set_rate(&mut self, context: &mut MonitorContext, rate: RefreshRate) {
        if self.state.mode == Mode::Party {
            self.state.saved_rate = Some(rate);
            tracing::debug!(%rate, "rate queued until party mode ends");
            return;
        }
        context.rate = rate;
        self.state.mode = mode_for_interval(rate.interval());
        tracing::info!(%rate, mode = ?self.state.mode, "refresh rate changed");
    }

    fn toggle_party(&mut self, context: &mut MonitorContext) {
        if self.state.mode == Mode::Party {
            self.bands.stop();
            let rate = self.state.saved_rate.take().unwrap_or(context.rate);
            context.rate = rate;
            context.status = None;
            self.state.mode = mode_for_interval(rate.interval());
            self.state.force_resample();
            tracing::info!(%rate, "left party mode");
            return;
        }

        if !self.bands.start() {
            context.set_status(PARTY_UNAVAILABLE);
            return;
        }
        self.state.saved_rate = Some(context.rate);
        context.rate = RefreshRate::Party;
        context.status = None;
        self.state.mode = Mode::Party;
        tracing::info!("entered party mode");
    }

    /// Waits for input within the tick's budget. Returns as soon as one
    /// command has been handled so its effect is drawn on the next tick.
    pub fn poll_input<I: InputSource>(
        &mut self,
        context: &mut MonitorContext,
        input: &mut I,
    ) -> Result<()> {
        let (slice, total) = input_budget(self.state.mode, context.rate.interval());
        let mut remaining = total;
        loop {
            let wait = slice.min(remaining);
            if let Some(command) = input.poll(wait)? {
                self.handle(context, command);
                return Ok(());
            }
            remaining = remaining.saturating_sub(wait);
            if remaining.is_zero() {
                return Ok(());
            }
        }
    }

    /// Ticks until a quit command arrives. The band source is stopped on the
    /// way out whatever the outcome.
    pub fn run<R, I>(
        &mut self,
        context: &mut MonitorContext,
        renderer: &mut R,
        input: &mut I,
    ) -> Result<()>
    where
        R: Renderer,
        I: InputSource,
    {
        tracing::info!(rate = %context.rate, mode = ?self.state.mode, "monitor started");
        let outcome = self.run_loop(context, renderer, input);
        self.bands.stop();
        tracing::info!("monitor stopped");
        outcome
    }

    fn run_loop<R, I>(
        &mut self,
        context: &mut MonitorContext,
        renderer: &mut R,
        input: &mut I,
    ) -> Result<()>
    where
        R: Renderer,
        I: InputSource,
    {
        while context.running {
            let frame = self.tick(context, Instant::now());
            renderer.render(&frame)?;
            self.poll_input(context, input)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::{
        audio::BandMagnitudes,
        telemetry::{ProcessRecord, ProcessSnapshot},
        WtopError,
    };

    #[derive(Default)]
    struct CountingSampler {
        cpu: usize,
        slow: usize,
    }

    impl SystemSampler for CountingSampler {
        fn sample_cpu(&mut self, stats: &mut SystemStats) {
            self.cpu += 1;
            stats.cpu_total = 12.0;
        }

        fn sample_slow(&mut self, _stats: &mut SystemStats) {
            self.slow += 1;
        }
    }

    struct FakeBands {
        available: bool,
        running: bool,
        starts: usize,
        stops: usize,
        levels: BandMagnitudes,
    }

    impl FakeBands {
        fn new(available: bool) -> Self {
            Self {
                available,
                running: false,
                starts: 0,
                stops: 0,
                levels: BandMagnitudes {
                    ram: 42.0,
                    swap: 7.0,
                    disk: 3.0,
                    cpu: vec![50.0, 10.0],
                },
            }
        }
    }

    impl BandSource for FakeBands {
        fn start(&mut self) -> bool {
            self.starts += 1;
            self.running = self.available;
            self.available
        }

        fn stop(&mut self) {
            self.stops += 1;
            self.running = false;
        }

        fn magnitudes(&self) -> BandMagnitudes {
            self.levels.clone()
        }

        fn is_running(&self) -> bool {
            self.running
        }
    }

    #[derive(Default)]
    struct FakeSource {
        calls: usize,
        fail: bool,
    }

    impl SnapshotSource for FakeSource {
        fn snapshot(&mut self) -> Result<ProcessSnapshot> {
            self.calls += 1;
            if self.fail {
                return Err(WtopError::KernelQuery { status: 0xC000_0001 });
            }
            let record = ProcessRecord {
                pid: 4,
                parent_pid: 0,
                name: "System".into(),
                thread_count: 100,
                user_time_ticks: 0,
                kernel_time_ticks: 1_000 * self.calls as u64,
                working_set_bytes: 0,
            };
            Ok(ProcessSnapshot::new(vec![record], Instant::now()))
        }
    }

    type TestScheduler = SamplingScheduler<CountingSampler, FakeBands, FakeSource>;

    fn scheduler(context: &MonitorContext, bands_available: bool) -> TestScheduler {
        SamplingScheduler::new(
            ProcessTelemetry::new(FakeSource::default(), 4),
            CountingSampler::default(),
            FakeBands::new(bands_available),
            context,
        )
    }

    fn source_calls(scheduler: &TestScheduler) -> usize {
        scheduler.telemetry.source().calls
    }

    #[test]
    fn mode_follows_interval() {
        assert_eq!(mode_for_interval(Duration::from_millis(500)), Mode::Normal);
        assert_eq!(mode_for_interval(Duration::from_millis(499)), Mode::HighSpeed);
        assert_eq!(mode_for_interval(RefreshRate::Slow.interval()), Mode::Normal);
    }

    #[test]
    fn normal_mode_samples_everything_once_per_interval() {
        let mut context = MonitorContext::new(RefreshRate::Fast);
        let mut scheduler = scheduler(&context, true);
        let start = Instant::now();

        for ms in [0, 500, 999, 1_000, 1_500] {
            scheduler.tick(&mut context, start + Duration::from_millis(ms));
        }

        assert_eq!(scheduler.mode(), Mode::Normal);
        assert_eq!(scheduler.sampler().cpu, 2);
        assert_eq!(scheduler.sampler().slow, 2);
        assert_eq!(source_calls(&scheduler), 2);
        assert_eq!(context.processes.len(), 1);
    }

    #[test]
    fn high_speed_splits_cpu_and_slow_cadences() {
        let mut context = MonitorContext::new(RefreshRate::Ultrafast);
        let mut scheduler = scheduler(&context, true);
        let start = Instant::now();

        for step in 0..=10 {
            scheduler.tick(&mut context, start + Duration::from_millis(100 * step));
        }

        assert_eq!(scheduler.mode(), Mode::HighSpeed);
        assert_eq!(scheduler.sampler().cpu, 11);
        assert_eq!(scheduler.sampler().slow, 3);
        assert_eq!(source_calls(&scheduler), 3);
    }

    #[test]
    fn party_round_trip_restores_the_exact_rate() {
        let custom = RefreshRate::Custom(Duration::from_millis(250));
        let mut context = MonitorContext::new(custom);
        let mut scheduler = scheduler(&context, true);

        scheduler.handle(&mut context, Command::ToggleParty);
        assert_eq!(scheduler.mode(), Mode::Party);
        assert_eq!(context.rate, RefreshRate::Party);
        assert!(scheduler.bands().is_running());

        scheduler.handle(&mut context, Command::ToggleParty);
        assert_eq!(context.rate, custom);
        assert_eq!(scheduler.mode(), Mode::HighSpeed);
        assert!(!scheduler.bands().is_running());
        assert_eq!(scheduler.bands().stops, 1);
        assert!(scheduler.state().saved_rate.is_none());
    }

    #[test]
    fn party_mode_substitutes_bands_and_skips_sampling() {
        let mut context = MonitorContext::new(RefreshRate::Slow);
        let mut scheduler = scheduler(&context, true);
        scheduler.handle(&mut context, Command::ToggleParty);
        let start = Instant::now();

        let mut frame = None;
        for step in 0..60 {
            frame = Some(scheduler.tick(&mut context, start + Duration::from_millis(17 * step)));
        }
        let frame = frame.unwrap();

        assert_eq!(scheduler.sampler().cpu, 0);
        assert_eq!(scheduler.sampler().slow, 0);
        assert_eq!(source_calls(&scheduler), 0);
        assert_eq!(frame.mode, Mode::Party);
        assert_eq!(frame.memory_percent, 42.0);
        assert_eq!(frame.swap_percent, 7.0);
        assert_eq!(frame.disk_percent, 3.0);
        assert_eq!(frame.cpu_total, 30.0);
    }

    #[test]
    fn rejected_party_entry_leaves_state_alone() {
        let mut context = MonitorContext::new(RefreshRate::Medium);
        let mut scheduler = scheduler(&context, false);

        scheduler.handle(&mut context, Command::ToggleParty);

        assert_eq!(scheduler.mode(), Mode::Normal);
        assert_eq!(context.rate, RefreshRate::Medium);
        assert_eq!(context.status.as_deref(), Some(PARTY_UNAVAILABLE));
        assert!(scheduler.state().saved_rate.is_none());
        assert_eq!(scheduler.bands().starts, 1);
    }

    #[test]
    fn rate_change_during_party_is_applied_on_exit() {
        let mut context = MonitorContext::new(RefreshRate::Slow);
        let mut scheduler = scheduler(&context, true);

        scheduler.handle(&mut context, Command::ToggleParty);
        scheduler.handle(&mut context, Command::SetRefreshRate(RefreshRate::Ultrafast));
        assert_eq!(context.rate, RefreshRate::Party);

        scheduler.handle(&mut context, Command::ToggleParty);
        assert_eq!(context.rate, RefreshRate::Ultrafast);
        assert_eq!(scheduler.mode(), Mode::HighSpeed);
    }

    #[test]
    fn view_commands_update_the_table_and_status() {
        let mut context = MonitorContext::new(RefreshRate::Fast);
        let mut scheduler = scheduler(&context, true);
        scheduler.tick(&mut context, Instant::now());

        scheduler.handle(&mut context, Command::SortBy(SortKey::Name));
        assert_eq!(context.status.as_deref(), Some("Sorted by name (desc)"));
        scheduler.handle(&mut context, Command::SortBy(SortKey::Name));
        assert_eq!(context.status.as_deref(), Some("Sorted by name (asc)"));

        scheduler.handle(&mut context, Command::SetFilter("sys".into()));
        assert_eq!(context.status.as_deref(), Some("Filter: 'sys'"));
        let frame = scheduler.tick(&mut context, Instant::now());
        assert_eq!(frame.processes.len(), 1);

        scheduler.handle(&mut context, Command::SetFilter("nothing".into()));
        assert!(scheduler.tick(&mut context, Instant::now()).processes.is_empty());
        scheduler.handle(&mut context, Command::SetFilter(String::new()));
        assert_eq!(context.status.as_deref(), Some("Filter cleared"));
    }

    #[test]
    fn scrolling_is_bounded_by_the_filtered_list() {
        let mut context = MonitorContext::new(RefreshRate::Fast);
        let mut scheduler = scheduler(&context, true);
        scheduler.tick(&mut context, Instant::now());

        scheduler.handle(&mut context, Command::ScrollBy(PAGE_ROWS));
        assert_eq!(context.view.offset, 0);
        scheduler.handle(&mut context, Command::ScrollBottom);
        assert_eq!(context.view.offset, 0);

        context.view.offset = 5;
        scheduler.handle(&mut context, Command::ScrollTop);
        assert_eq!(context.view.offset, 0);
    }

    #[test]
    fn failed_process_refresh_keeps_the_stale_list() {
        let mut context = MonitorContext::new(RefreshRate::Fast);
        let mut scheduler = scheduler(&context, true);
        let start = Instant::now();

        scheduler.tick(&mut context, start);
        assert_eq!(context.processes.len(), 1);

        scheduler.telemetry.source_mut().fail = true;
        let frame = scheduler.tick(&mut context, start + Duration::from_secs(1));
        assert_eq!(frame.processes.len(), 1);
        assert_eq!(scheduler.sampler().cpu, 2);
    }

    #[test]
    fn input_budget_per_mode() {
        assert_eq!(
            input_budget(Mode::Normal, Duration::from_secs(3)),
            (INPUT_SLICE, Duration::from_millis(100))
        );
        assert_eq!(
            input_budget(Mode::Normal, Duration::from_millis(500)),
            (INPUT_SLICE, Duration::from_millis(100))
        );
        assert_eq!(
            input_budget(Mode::HighSpeed, Duration::from_millis(100)),
            (Duration::from_millis(50), Duration::from_millis(50))
        );
        assert_eq!(
            input_budget(Mode::Party, Duration::from_micros(1_000)),
            (MIN_POLL, MIN_POLL)
        );
    }

    struct ScriptedInput {
        script: VecDeque<Option<Command>>,
        timeouts: Vec<Duration>,
    }

    impl ScriptedInput {
        fn new(script: impl IntoIterator<Item = Option<Command>>) -> Self {
            Self {
                script: script.into_iter().collect(),
                timeouts: Vec::new(),
            }
        }
    }

    impl InputSource for ScriptedInput {
        fn poll(&mut self, timeout: Duration) -> Result<Option<Command>> {
            self.timeouts.push(timeout);
            Ok(self.script.pop_front().unwrap_or(Some(Command::Quit)))
        }
    }

    #[derive(Default)]
    struct RecordingRenderer {
        frames: Vec<RenderSnapshot>,
    }

    impl Renderer for RecordingRenderer {
        fn render(&mut self, snapshot: &RenderSnapshot) -> Result<()> {
            self.frames.push(snapshot.clone());
            Ok(())
        }
    }

    #[test]
    fn normal_mode_polls_in_slices_until_quit() {
        let mut context = MonitorContext::new(RefreshRate::Slow);
        let mut scheduler = scheduler(&context, true);
        let mut renderer = RecordingRenderer::default();
        let mut input = ScriptedInput::new([None, None, None, None, None, Some(Command::Quit)]);

        scheduler
            .run(&mut context, &mut renderer, &mut input)
            .unwrap();

        assert!(!context.running);
        assert_eq!(renderer.frames.len(), 2);
        assert_eq!(input.timeouts, vec![INPUT_SLICE; 6]);
        assert_eq!(scheduler.bands().stops, 1);
    }

    #[test]
    fn run_leaves_party_mode_cleanly_on_quit() {
        let mut context = MonitorContext::new(RefreshRate::Fast);
        let mut scheduler = scheduler(&context, true);
        let mut renderer = RecordingRenderer::default();
        let mut input = ScriptedInput::new([Some(Command::ToggleParty), Some(Command::Quit)]);

        scheduler
            .run(&mut context, &mut renderer, &mut input)
            .unwrap();

        assert_eq!(renderer.frames.len(), 2);
        assert_eq!(renderer.frames[1].mode, Mode::Party);
        assert!(!scheduler.bands().is_running());
    }

    #[test]
    fn renderer_errors_end_the_loop() {
        struct Broken;
        impl Renderer for Broken {
            fn render(&mut self, _snapshot: &RenderSnapshot) -> Result<()> {
                Err(WtopError::msg("terminal closed"))
            }
        }

        let mut context = MonitorContext::new(RefreshRate::Fast);
        let mut scheduler = scheduler(&context, true);
        let mut input = ScriptedInput::new(Vec::<Option<Command>>::new());
        assert!(scheduler.run(&mut context, &mut Broken, &mut input).is_err());
        assert_eq!(scheduler.bands().stops, 1);
    }
}
