use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use tracing::{error, info, warn};

use super::{Burst, BurstPipeline};
use crate::{tier::PartitionedTier, ImpulserError, Result};

enum Job {
    Run(Burst),
    Install(Option<Box<PartitionedTier>>),
    Mute,
    Shutdown,
}

/// Computes bursts on a dedicated background thread.
///
/// Two [`Burst`] values circulate between the real-time thread and the
/// worker. Whichever side holds a burst owns it exclusively, so no lock is
/// shared on the audio path. The large tier itself lives on the worker
/// thread and is only replaced through the job queue.
///
/// The real-time side never waits for the worker. A burst that is not back
/// when it is due counts as an overrun: a third, silent burst is played in
/// its place, so the tail is missing for that one large period, and the
/// late result is thrown away when it arrives. Only
/// [`suspend`](BurstPipeline::suspend) blocks. Rendering faster than real
/// time opts into waiting with [`set_offline`](BurstPipeline::set_offline).
///
/// The worker starts suspended. Installing a new tier is only allowed while
/// suspended; [`resume`](BurstPipeline::resume) lets bursts flow.
pub struct BurstWorker {
    jobs: Sender<Job>,
    done: Receiver<Burst>,
    handle: Option<JoinHandle<()>>,
    /// Next burst to play, held here while nothing is in flight.
    parked: Option<Burst>,
    /// Silent burst handed out on an overrun.
    silent: Option<Burst>,
    in_flight: usize,
    /// In-flight results computed before the last mute.
    stale: usize,
    offline: bool,
    suspended: bool,
    overruns: u64,
}

impl BurstWorker {
    /// Spawns the worker thread.
    pub fn spawn() -> Result<Self> {
        let (jobs, job_rx) = bounded::<Job>(4);
        let (done_tx, done) = bounded::<Burst>(2);
        let handle = thread::Builder::new()
            .name("impulser-burst".to_string())
            .spawn(move || worker_loop(job_rx, done_tx))?;
        info!("burst worker started");
        Ok(Self::with_channels(jobs, done, Some(handle)))
    }

    fn with_channels(
        jobs: Sender<Job>,
        done: Receiver<Burst>,
        handle: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            jobs,
            done,
            handle,
            parked: None,
            silent: None,
            in_flight: 0,
            stale: 0,
            offline: false,
            suspended: true,
            overruns: 0,
        }
    }

    fn send(&self, job: Job) -> Result<()> {
        self.jobs
            .send(job)
            .map_err(|_| ImpulserError::WorkerDisconnected)
    }

    fn collect(&mut self, mut burst: Burst) -> Burst {
        self.in_flight -= 1;
        if self.stale > 0 {
            self.stale -= 1;
            burst.output.mute();
        }
        burst
    }

    fn try_collect(&mut self) -> Result<Option<Burst>> {
        match self.done.try_recv() {
            Ok(burst) => Ok(Some(self.collect(burst))),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ImpulserError::WorkerDisconnected),
        }
    }

    /// Result of the oldest burst in flight; waits for it only when offline.
    fn next_result(&mut self) -> Result<Option<Burst>> {
        if !self.offline {
            return self.try_collect();
        }
        let burst = self
            .done
            .recv()
            .map_err(|_| ImpulserError::WorkerDisconnected)?;
        Ok(Some(self.collect(burst)))
    }

    /// Keeps a burst that missed its period as the silent spare.
    fn retire(&mut self, mut burst: Burst) {
        burst.mute();
        self.silent = Some(burst);
    }

    fn record_overrun(&mut self) {
        self.overruns += 1;
        warn!(
            overruns = self.overruns,
            "large-block burst not ready in time, tail dropped for one period; \
             increase factor or fragment size"
        );
    }

    /// Blocks until every burst in flight is back on this side.
    fn settle(&mut self) -> Result<()> {
        while self.in_flight > 0 {
            let burst = self
                .done
                .recv()
                .map_err(|_| ImpulserError::WorkerDisconnected)?;
            let burst = self.collect(burst);
            if self.in_flight > 0 {
                self.retire(burst);
            } else {
                self.parked = Some(burst);
            }
        }
        Ok(())
    }
}

impl BurstPipeline for BurstWorker {
    fn install(&mut self, tier: Option<PartitionedTier>, burst_len: usize) -> Result<()> {
        if !self.suspended {
            return Err(ImpulserError::Precondition(
                "suspend the burst worker before replacing its impulse response",
            ));
        }
        let parked = Burst::zeroed(burst_len)?;
        let silent = Burst::zeroed(burst_len)?;
        self.send(Job::Install(tier.map(Box::new)))?;
        self.parked = Some(parked);
        self.silent = Some(silent);
        self.stale = 0;
        Ok(())
    }

    fn exchange(&mut self, mut finished: Burst) -> Result<Burst> {
        if self.suspended {
            return Err(ImpulserError::Suspended);
        }

        if self.in_flight > 1 {
            match self.next_result()? {
                Some(late) => self.retire(late),
                None => {
                    // Both other bursts are still with the worker.
                    self.record_overrun();
                    finished.output.mute();
                    return Ok(finished);
                }
            }
        }

        let next = match self.parked.take() {
            Some(burst) => burst,
            None if self.in_flight == 0 => return Err(ImpulserError::NotLoaded),
            None => match self.next_result()? {
                Some(burst) => burst,
                None => {
                    self.record_overrun();
                    self.silent.take().ok_or(ImpulserError::NotLoaded)?
                }
            },
        };

        self.send(Job::Run(finished))?;
        self.in_flight += 1;
        Ok(next)
    }

    fn mute(&mut self) -> Result<()> {
        self.send(Job::Mute)?;
        self.stale = self.in_flight;
        for burst in self.parked.iter_mut().chain(self.silent.iter_mut()) {
            burst.mute();
        }
        Ok(())
    }

    fn suspend(&mut self) -> Result<()> {
        self.settle()?;
        self.suspended = true;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.suspended = false;
        Ok(())
    }

    fn is_suspended(&self) -> bool {
        self.suspended
    }

    fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
    }

    fn is_idle(&self) -> bool {
        self.suspended
    }

    fn overrun_count(&self) -> u64 {
        self.overruns
    }
}

impl Drop for BurstWorker {
    fn drop(&mut self) {
        let _ = self.settle();
        let _ = self.jobs.send(Job::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("burst worker panicked");
            }
        }
        info!("burst worker stopped");
    }
}

impl std::fmt::Debug for BurstWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BurstWorker")
            .field("in_flight", &self.in_flight)
            .field("offline", &self.offline)
            .field("suspended", &self.suspended)
            .field("overruns", &self.overruns)
            .finish()
    }
}

fn worker_loop(jobs: Receiver<Job>, done: Sender<Burst>) {
    let mut tier: Option<Box<PartitionedTier>> = None;

    while let Ok(job) = jobs.recv() {
        match job {
            Job::Run(mut burst) => {
                match tier.as_deref_mut() {
                    Some(tier) => {
                        if let Err(err) = burst.run(tier) {
                            error!(%err, "large-block burst failed");
                            burst.output.mute();
                        }
                    }
                    None => burst.output.mute(),
                }
                if done.send(burst).is_err() {
                    break;
                }
            }
            Job::Install(next) => tier = next,
            Job::Mute => {
                if let Some(tier) = tier.as_deref_mut() {
                    tier.mute();
                }
            }
            Job::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::{burst::InlineBursts, test_support::TOLERANCE, Sample};

    fn impulse_burst(len: usize, at: usize) -> Burst {
        let mut burst = Burst::zeroed(len).unwrap();
        burst.input.left[at] = 1.0;
        burst.input.right[at] = -1.0;
        burst
    }

    fn is_silent(burst: &Burst) -> bool {
        burst.output.left.iter().chain(&burst.output.right).all(|s| *s == 0.0)
    }

    /// Worker without a thread; the test answers the jobs itself.
    fn detached() -> (BurstWorker, Receiver<Job>, Sender<Burst>) {
        let (jobs, job_rx) = bounded::<Job>(4);
        let (done_tx, done) = bounded::<Burst>(2);
        let mut worker = BurstWorker::with_channels(jobs, done, None);
        worker.install(None, 2).unwrap();
        assert!(matches!(job_rx.try_recv(), Ok(Job::Install(None))));
        worker.resume().unwrap();
        (worker, job_rx, done_tx)
    }

    /// Takes the next queued burst and answers it with a constant output.
    fn answer(jobs: &Receiver<Job>, done: &Sender<Burst>, value: Sample) {
        match jobs.try_recv() {
            Ok(Job::Run(mut burst)) => {
                burst.output.left.fill(value);
                burst.output.right.fill(value);
                done.send(burst).unwrap();
            }
            _ => panic!("expected a queued burst"),
        }
    }

    #[test]
    fn matches_inline_pipeline() {
        let ir: Vec<Sample> = (0..12).map(|i| 1.0 / (i + 1) as Sample).collect();
        let mut worker = BurstWorker::spawn().unwrap();
        let mut inline = InlineBursts::new();
        worker.set_offline(true);
        worker
            .install(Some(PartitionedTier::new(&ir, &ir, 4).unwrap()), 4)
            .unwrap();
        inline
            .install(Some(PartitionedTier::new(&ir, &ir, 4).unwrap()), 4)
            .unwrap();
        worker.resume().unwrap();

        for period in 0..6 {
            let a = worker.exchange(impulse_burst(4, period % 4)).unwrap();
            let b = inline.exchange(impulse_burst(4, period % 4)).unwrap();
            assert_eq!(a.output, b.output);
        }
        assert_eq!(worker.overrun_count(), 0);
    }

    #[test]
    fn install_requires_suspension() {
        let mut worker = BurstWorker::spawn().unwrap();
        worker.resume().unwrap();
        let err = worker.install(None, 4).unwrap_err();
        assert!(matches!(err, ImpulserError::Precondition(_)));

        worker.suspend().unwrap();
        worker.install(None, 4).unwrap();
        let err = worker.exchange(Burst::zeroed(4).unwrap()).unwrap_err();
        assert!(matches!(err, ImpulserError::Suspended));
    }

    #[test]
    fn suspend_keeps_the_pipeline_position() {
        let ir = [1.0, 0.5];
        let mut worker = BurstWorker::spawn().unwrap();
        worker
            .install(Some(PartitionedTier::new(&ir, &ir, 2).unwrap()), 2)
            .unwrap();
        worker.resume().unwrap();

        worker.exchange(impulse_burst(2, 0)).unwrap();
        worker.suspend().unwrap();
        worker.resume().unwrap();
        let played = worker.exchange(Burst::zeroed(2).unwrap()).unwrap();
        assert_abs_diff_eq!(played.output.left[0], 1.0, epsilon = TOLERANCE);
        assert_abs_diff_eq!(played.output.left[1], 0.5, epsilon = TOLERANCE);
        assert_eq!(worker.overrun_count(), 0);
    }

    #[test]
    fn late_bursts_are_replaced_by_silence_without_waiting() {
        let (mut worker, jobs, done) = detached();

        // Nothing in flight yet: the installed silent burst plays.
        assert!(is_silent(&worker.exchange(impulse_burst(2, 0)).unwrap()));

        // The first burst is still with the worker: play the spare.
        assert!(is_silent(&worker.exchange(impulse_burst(2, 1)).unwrap()));
        assert_eq!(worker.overrun_count(), 1);

        // Two bursts behind: the finished one comes straight back, muted.
        let returned = worker.exchange(impulse_burst(2, 0)).unwrap();
        assert!(is_silent(&returned));
        assert_eq!(returned.input.left[0], 1.0);
        assert_eq!(worker.overrun_count(), 2);

        answer(&jobs, &done, 1.0);
        answer(&jobs, &done, 2.0);
        assert!(jobs.try_recv().is_err());

        // The late first result is dropped, the second one plays on time.
        let played = worker.exchange(Burst::zeroed(2).unwrap()).unwrap();
        assert_eq!(played.output.left, vec![2.0, 2.0]);
        assert_eq!(worker.overrun_count(), 2);

        answer(&jobs, &done, 3.0);
        let played = worker.exchange(Burst::zeroed(2).unwrap()).unwrap();
        assert_eq!(played.output.right, vec![3.0, 3.0]);

        drop(jobs);
        drop(done);
    }

    #[test]
    fn mute_silences_results_still_in_flight() {
        let (mut worker, jobs, done) = detached();
        worker.exchange(impulse_burst(2, 0)).unwrap();
        worker.mute().unwrap();

        answer(&jobs, &done, 1.0);
        assert!(matches!(jobs.try_recv(), Ok(Job::Mute)));
        assert!(is_silent(&worker.exchange(Burst::zeroed(2).unwrap()).unwrap()));

        answer(&jobs, &done, 4.0);
        let played = worker.exchange(Burst::zeroed(2).unwrap()).unwrap();
        assert_eq!(played.output.left, vec![4.0, 4.0]);
        assert_eq!(worker.overrun_count(), 0);

        drop(jobs);
        drop(done);
    }
}
