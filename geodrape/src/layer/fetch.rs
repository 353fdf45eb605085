//! Tile fetching: request issue, per-frame completion polling, and the
//! failure/retry protocol.
//!
//! Completions are delivered through oneshot channels and observed only when
//! the layer polls on an update pass, so every state transition happens on
//! the thread driving the layer. Cancellation is distinguished from failure
//! by the request handle: a cancelled fetch rolls silently back to
//! `Unloaded`, while a genuine failure goes through the error reporter.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::oneshot::error::TryRecvError;
use tracing::debug;

use crate::error::{ProviderError, RetryDecision, TileFailure};
use crate::imagery::{ImageryRecord, ImageryState, InFlightRequest, TileKey};
use crate::layer::ImageryLayer;
use crate::provider::{FetchOutcome, ImageData, RequestHandle};

impl ImageryLayer {
    /// Issues the fetch for an unloaded record. Multi-source providers get a
    /// chain of sequential sub-fetches; everyone else a single request. When
    /// the provider throttles, the record stays unloaded and the request is
    /// re-attempted on a later frame.
    pub(crate) fn begin_fetch(&self, record: &Arc<ImageryRecord>) {
        let key = match record.key() {
            Some(key) => key,
            None => return,
        };

        if let Some(plan) = self.provider().projected_source_plan(key.x, key.y, key.level) {
            let plan = Arc::new(plan);
            record.inner.lock().source_plan = Some(plan.clone());
            self.issue_sub_fetch(record, &plan, 0);
            return;
        }

        let handle = RequestHandle::new();
        match self.provider().request_image(key.x, key.y, key.level, &handle) {
            Some(future) => {
                self.metrics().request_issued();
                let mut inner = record.inner.lock();
                // Credits belong to requests that were actually accepted; a
                // throttled attempt attributes nothing.
                inner.credits = self.provider().tile_credits(key.x, key.y, key.level);
                inner.request = Some(InFlightRequest {
                    handle,
                    future,
                    source_index: 0,
                });
            }
            None => {
                self.metrics().request_throttled();
                return;
            }
        }
        record.set_state(ImageryState::Transitioning);
    }

    /// Issues sub-fetch `index` of a multi-source plan.
    fn issue_sub_fetch(
        &self,
        record: &Arc<ImageryRecord>,
        plan: &Arc<crate::provider::ProjectedSourcePlan>,
        index: usize,
    ) {
        let source = &plan.sources[index];
        let handle = RequestHandle::new();
        match self
            .provider()
            .request_image(source.x, source.y, plan.level, &handle)
        {
            Some(future) => {
                self.metrics().request_issued();
                let mut inner = record.inner.lock();
                if index + 1 == plan.sources.len() {
                    // The chain is now guaranteed to run to completion or
                    // fail loudly, so the assembled tile earns its credits.
                    if let Some(key) = record.key() {
                        inner.credits = self.provider().tile_credits(key.x, key.y, key.level);
                    }
                }
                inner.request = Some(InFlightRequest {
                    handle,
                    future,
                    source_index: index,
                });
            }
            None => {
                // Saturated mid-chain: keep accumulated source images and
                // re-attempt this sub-fetch on a later frame.
                self.metrics().request_throttled();
                if index == 0 {
                    record.set_state(ImageryState::Unloaded);
                }
                return;
            }
        }
        record.set_state(ImageryState::Transitioning);
    }

    /// Polls a transitioning record's fetch channel once.
    pub(crate) fn poll_request(&self, record: &Arc<ImageryRecord>) {
        let taken = record.inner.lock().request.take();
        let mut request = match taken {
            Some(request) => request,
            None => {
                // A multi-source chain stalled on throttling; resume it.
                self.resume_stalled_chain(record);
                return;
            }
        };

        match request.future.try_recv() {
            Err(TryRecvError::Empty) => {
                record.inner.lock().request = Some(request);
            }
            Ok(FetchOutcome::Image(image)) => {
                self.handle_image(record, request, image);
            }
            Ok(FetchOutcome::Empty) => {
                self.handle_failure(record, &request, None, "fetch completed without image data");
            }
            Ok(FetchOutcome::Failed(error)) => {
                self.handle_failure(record, &request, Some(error), "failed to obtain image tile");
            }
            Err(TryRecvError::Closed) => {
                self.handle_failure(
                    record,
                    &request,
                    Some(ProviderError::ChannelClosed),
                    "image request dropped before completion",
                );
            }
        }
    }

    fn resume_stalled_chain(&self, record: &Arc<ImageryRecord>) {
        let (plan, next_index) = {
            let inner = record.inner.lock();
            // Once textures exist the record is transitioning through the
            // reprojection pipeline, not the fetch chain.
            if !inner.projected_textures.is_empty() || inner.texture.is_some() {
                return;
            }
            match &inner.source_plan {
                Some(plan) => (plan.clone(), inner.projected_images.len()),
                None => return,
            }
        };
        if next_index < plan.sources.len() {
            self.issue_sub_fetch(record, &plan, next_index);
        }
    }

    fn handle_image(&self, record: &Arc<ImageryRecord>, request: InFlightRequest, image: ImageData) {
        let plan = record.inner.lock().source_plan.clone();

        match plan {
            Some(plan) => {
                let next_index = request.source_index + 1;
                record.inner.lock().projected_images.push(image);
                // Any successful sub-fetch proves the provider recovered,
                // even if the chain has more sources to go.
                self.signal_recovery();

                if next_index < plan.sources.len() {
                    self.issue_sub_fetch(record, &plan, next_index);
                    return;
                }
                record.set_state(ImageryState::Received);
            }
            None => {
                let mut inner = record.inner.lock();
                inner.image = Some(image);
                drop(inner);
                record.set_state(ImageryState::Received);
                self.signal_recovery();
            }
        }

        self.metrics().tile_received();
    }

    fn handle_failure(
        &self,
        record: &Arc<ImageryRecord>,
        request: &InFlightRequest,
        error: Option<ProviderError>,
        message: &str,
    ) {
        // Cancellation is not a failure: the record rolls back so the next
        // consumer (if any) silently re-requests it.
        if request.handle.is_cancelled() {
            debug!(key = ?record.key(), "cancelled imagery request rolled back");
            record.set_state(ImageryState::Unloaded);
            return;
        }

        self.metrics().fetch_failed();
        record.set_state(ImageryState::Failed);
        self.error_reported().store(true, Ordering::SeqCst);

        // Report the coordinates that were actually requested; for a
        // multi-source record that is the failing constituent image, not the
        // assembled tile.
        let plan = record.inner.lock().source_plan.clone();
        let (x, y, level) = match &plan {
            Some(plan) => {
                let source = &plan.sources[request.source_index];
                (source.x, source.y, plan.level)
            }
            None => {
                let key = record.key().unwrap_or(TileKey::new(0, 0, 0));
                (key.x, key.y, key.level)
            }
        };
        let failure = TileFailure {
            x,
            y,
            level,
            message: message.to_string(),
            error,
        };

        let decision = match self.error_reporter() {
            Some(reporter) => reporter.tile_failed(&failure),
            None => {
                debug!(
                    x = failure.x,
                    y = failure.y,
                    level = failure.level,
                    error = ?failure.error,
                    "{}",
                    failure.message
                );
                RetryDecision::GiveUp
            }
        };

        if decision == RetryDecision::Retry {
            self.metrics().fetch_retried();
            self.retry(record, request.source_index);
        }
    }

    fn retry(&self, record: &Arc<ImageryRecord>, failed_index: usize) {
        let plan = record.inner.lock().source_plan.clone();
        match plan {
            // Multi-source retries resume at the failed sub-fetch; earlier
            // source images are still good.
            Some(plan) => self.issue_sub_fetch(record, &plan, failed_index),
            None => {
                record.set_state(ImageryState::Unloaded);
                self.begin_fetch(record);
            }
        }
    }

    /// Notifies the reporter, once, that fetches succeed again.
    fn signal_recovery(&self) {
        if self.error_reported().swap(false, Ordering::SeqCst) {
            if let Some(reporter) = self.error_reporter() {
                reporter.recovered();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::error::FetchErrorReporter;
    use crate::geo::Rectangle;
    use crate::layer::LayerOptions;
    use crate::provider::tests::{test_image, MockProvider};
    use crate::provider::{ProjectedSource, ProjectedSourcePlan};

    fn layer_with(provider: MockProvider) -> (Arc<MockProvider>, ImageryLayer) {
        layer_with_options(provider, LayerOptions::default())
    }

    fn layer_with_options(
        provider: MockProvider,
        options: LayerOptions,
    ) -> (Arc<MockProvider>, ImageryLayer) {
        let provider = Arc::new(provider);
        let layer = ImageryLayer::new(provider.clone(), options);
        (provider, layer)
    }

    fn acquire(layer: &ImageryLayer, x: u32, y: u32, level: u32) -> Arc<ImageryRecord> {
        layer
            .cache()
            .acquire(TileKey::new(x, y, level), Rectangle::MAX_VALUE)
    }

    struct CountingReporter {
        failures: AtomicUsize,
        recoveries: AtomicUsize,
        last_failed_tile: parking_lot::Mutex<Option<(u32, u32, u32)>>,
        decision: RetryDecision,
    }

    impl CountingReporter {
        fn new(decision: RetryDecision) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicUsize::new(0),
                recoveries: AtomicUsize::new(0),
                last_failed_tile: parking_lot::Mutex::new(None),
                decision,
            })
        }
    }

    impl FetchErrorReporter for CountingReporter {
        fn tile_failed(&self, failure: &TileFailure) -> RetryDecision {
            self.failures.fetch_add(1, Ordering::SeqCst);
            *self.last_failed_tile.lock() = Some((failure.x, failure.y, failure.level));
            self.decision
        }

        fn recovered(&self) {
            self.recoveries.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_begin_fetch_moves_record_to_transitioning() {
        let (provider, layer) = layer_with(MockProvider::geographic());
        let record = acquire(&layer, 1, 2, 3);

        layer.begin_fetch(&record);
        assert_eq!(record.state(), ImageryState::Transitioning);
        assert_eq!(provider.pending_count(), 1);
        assert_eq!(layer.metrics().snapshot().requests_issued, 1);
        assert_eq!(record.credits().len(), 1);
    }

    #[test]
    fn test_throttled_fetch_stays_unloaded() {
        let mock = MockProvider::geographic();
        *mock.throttle.lock() = true;
        let (provider, layer) = layer_with(mock);
        let record = acquire(&layer, 0, 0, 0);

        layer.begin_fetch(&record);
        assert_eq!(record.state(), ImageryState::Unloaded);
        assert_eq!(layer.metrics().snapshot().requests_throttled, 1);
        // Nothing was requested, so nothing is credited yet.
        assert!(record.credits().is_empty());

        // Un-throttle; the next attempt goes through.
        *provider.throttle.lock() = false;
        layer.begin_fetch(&record);
        assert_eq!(record.state(), ImageryState::Transitioning);
    }

    #[test]
    fn test_poll_before_completion_keeps_transitioning() {
        let (_provider, layer) = layer_with(MockProvider::geographic());
        let record = acquire(&layer, 0, 0, 1);
        layer.begin_fetch(&record);

        layer.poll_request(&record);
        layer.poll_request(&record);
        assert_eq!(record.state(), ImageryState::Transitioning);
    }

    #[test]
    fn test_successful_fetch_reaches_received() {
        let (provider, layer) = layer_with(MockProvider::geographic());
        let record = acquire(&layer, 0, 0, 1);
        layer.begin_fetch(&record);

        provider.resolve_next(FetchOutcome::Image(test_image()));
        layer.poll_request(&record);

        assert_eq!(record.state(), ImageryState::Received);
        assert!(record.inner.lock().image.is_some());
        assert_eq!(layer.metrics().snapshot().tiles_received, 1);
    }

    #[test]
    fn test_cancelled_fetch_rolls_back_silently() {
        let reporter = CountingReporter::new(RetryDecision::GiveUp);
        let (provider, layer) = layer_with_options(
            MockProvider::geographic(),
            LayerOptions {
                error_reporter: Some(reporter.clone()),
                ..LayerOptions::default()
            },
        );
        let record = acquire(&layer, 0, 0, 1);
        layer.begin_fetch(&record);

        provider.cancel_next();
        layer.poll_request(&record);

        assert_eq!(record.state(), ImageryState::Unloaded);
        assert_eq!(reporter.failures.load(Ordering::SeqCst), 0);
        assert_eq!(layer.metrics().snapshot().fetch_failures, 0);
    }

    #[test]
    fn test_failed_fetch_reports_and_gives_up() {
        let reporter = CountingReporter::new(RetryDecision::GiveUp);
        let (provider, layer) = layer_with_options(
            MockProvider::geographic(),
            LayerOptions {
                error_reporter: Some(reporter.clone()),
                ..LayerOptions::default()
            },
        );
        let record = acquire(&layer, 5, 6, 7);
        layer.begin_fetch(&record);

        provider.resolve_next(FetchOutcome::Failed(ProviderError::Request(
            "HTTP 500".to_string(),
        )));
        layer.poll_request(&record);

        assert_eq!(record.state(), ImageryState::Failed);
        assert_eq!(reporter.failures.load(Ordering::SeqCst), 1);
        assert_eq!(provider.pending_count(), 0);
    }

    #[test]
    fn test_retry_decision_reissues_request() {
        let reporter = CountingReporter::new(RetryDecision::Retry);
        let (provider, layer) = layer_with_options(
            MockProvider::geographic(),
            LayerOptions {
                error_reporter: Some(reporter.clone()),
                ..LayerOptions::default()
            },
        );
        let record = acquire(&layer, 5, 6, 7);
        layer.begin_fetch(&record);

        provider.resolve_next(FetchOutcome::Failed(ProviderError::Request(
            "HTTP 503".to_string(),
        )));
        layer.poll_request(&record);

        // Reported once, then immediately back in flight.
        assert_eq!(reporter.failures.load(Ordering::SeqCst), 1);
        assert_eq!(record.state(), ImageryState::Transitioning);
        assert_eq!(provider.pending_count(), 1);
        assert_eq!(layer.metrics().snapshot().fetch_retries, 1);

        // Success after retry triggers the one-shot recovery signal.
        provider.resolve_next(FetchOutcome::Image(test_image()));
        layer.poll_request(&record);
        assert_eq!(record.state(), ImageryState::Received);
        assert_eq!(reporter.recoveries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_channel_without_cancel_is_failure() {
        let reporter = CountingReporter::new(RetryDecision::GiveUp);
        let (provider, layer) = layer_with_options(
            MockProvider::geographic(),
            LayerOptions {
                error_reporter: Some(reporter.clone()),
                ..LayerOptions::default()
            },
        );
        let record = acquire(&layer, 0, 0, 2);
        layer.begin_fetch(&record);

        // Drop the sender without cancelling the handle.
        provider.pending.lock().remove(0);
        layer.poll_request(&record);

        assert_eq!(record.state(), ImageryState::Failed);
        assert_eq!(reporter.failures.load(Ordering::SeqCst), 1);
    }

    fn three_source_plan() -> ProjectedSourcePlan {
        ProjectedSourcePlan {
            level: 4,
            sources: (0..3)
                .map(|i| ProjectedSource {
                    x: i,
                    y: 0,
                    rectangle: Rectangle::new(i as f64, 0.0, i as f64 + 1.0, 1.0),
                })
                .collect(),
        }
    }

    #[test]
    fn test_multi_source_fetches_run_sequentially() {
        let mut mock = MockProvider::geographic();
        mock.plan = Some(three_source_plan());
        let (provider, layer) = layer_with(mock);
        let record = acquire(&layer, 0, 0, 4);

        layer.begin_fetch(&record);
        // Only the first sub-fetch is in flight.
        assert_eq!(provider.pending_count(), 1);
        assert_eq!(provider.pending.lock()[0].x, 0);

        for expected_next in [1u32, 2] {
            provider.resolve_next(FetchOutcome::Image(test_image()));
            layer.poll_request(&record);
            assert_eq!(record.state(), ImageryState::Transitioning);
            assert_eq!(provider.pending_count(), 1);
            assert_eq!(provider.pending.lock()[0].x, expected_next);
        }

        // Final sub-fetch completes the record.
        provider.resolve_next(FetchOutcome::Image(test_image()));
        layer.poll_request(&record);
        assert_eq!(record.state(), ImageryState::Received);
        assert_eq!(record.inner.lock().projected_images.len(), 3);
        assert_eq!(layer.metrics().snapshot().tiles_received, 1);
    }

    #[test]
    fn test_multi_source_chain_resumes_after_throttle() {
        let mut mock = MockProvider::geographic();
        mock.plan = Some(three_source_plan());
        let (provider, layer) = layer_with(mock);
        let record = acquire(&layer, 0, 0, 4);

        layer.begin_fetch(&record);

        // First image arrives while the provider is saturated; the chain
        // stalls without losing progress.
        *provider.throttle.lock() = true;
        provider.resolve_next(FetchOutcome::Image(test_image()));
        layer.poll_request(&record);
        assert_eq!(record.inner.lock().projected_images.len(), 1);
        assert_eq!(provider.pending_count(), 0);

        // Next frame the chain resumes where it left off.
        *provider.throttle.lock() = false;
        layer.poll_request(&record);
        assert_eq!(provider.pending_count(), 1);
        assert_eq!(provider.pending.lock()[0].x, 1);
    }

    #[test]
    fn test_multi_source_failure_reports_source_coordinates() {
        let reporter = CountingReporter::new(RetryDecision::GiveUp);
        let mut mock = MockProvider::geographic();
        mock.plan = Some(ProjectedSourcePlan {
            level: 9,
            sources: vec![
                ProjectedSource {
                    x: 50,
                    y: 51,
                    rectangle: Rectangle::new(0.0, 0.0, 1.0, 1.0),
                },
                ProjectedSource {
                    x: 60,
                    y: 61,
                    rectangle: Rectangle::new(1.0, 0.0, 2.0, 1.0),
                },
            ],
        });
        let (provider, layer) = layer_with_options(
            mock,
            LayerOptions {
                error_reporter: Some(reporter.clone()),
                ..LayerOptions::default()
            },
        );
        let record = acquire(&layer, 7, 8, 3);

        layer.begin_fetch(&record);
        provider.resolve_next(FetchOutcome::Failed(ProviderError::Request(
            "HTTP 500".to_string(),
        )));
        layer.poll_request(&record);

        // The reporter sees the constituent image that failed, not the
        // assembled tile's key.
        assert_eq!(*reporter.last_failed_tile.lock(), Some((50, 51, 9)));
    }

    #[test]
    fn test_sub_fetch_success_mid_chain_signals_recovery() {
        let reporter = CountingReporter::new(RetryDecision::Retry);
        let mut mock = MockProvider::geographic();
        mock.plan = Some(three_source_plan());
        let (provider, layer) = layer_with_options(
            mock,
            LayerOptions {
                error_reporter: Some(reporter.clone()),
                ..LayerOptions::default()
            },
        );
        let record = acquire(&layer, 0, 0, 4);

        layer.begin_fetch(&record);
        provider.resolve_next(FetchOutcome::Failed(ProviderError::Request(
            "HTTP 503".to_string(),
        )));
        layer.poll_request(&record);
        assert_eq!(reporter.failures.load(Ordering::SeqCst), 1);
        assert_eq!(provider.pending.lock()[0].x, 0);

        // The retried sub-fetch succeeding is a recovery, even though two
        // more sources are still outstanding.
        provider.resolve_next(FetchOutcome::Image(test_image()));
        layer.poll_request(&record);
        assert_eq!(record.state(), ImageryState::Transitioning);
        assert_eq!(provider.pending.lock()[0].x, 1);
        assert_eq!(reporter.recoveries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_multi_source_credits_arrive_with_final_sub_fetch() {
        let mut mock = MockProvider::geographic();
        mock.plan = Some(three_source_plan());
        let (provider, layer) = layer_with(mock);
        let record = acquire(&layer, 0, 0, 4);

        layer.begin_fetch(&record);
        assert!(record.credits().is_empty());

        provider.resolve_next(FetchOutcome::Image(test_image()));
        layer.poll_request(&record);
        assert!(record.credits().is_empty());

        // Issuing the last sub-fetch credits the assembled tile.
        provider.resolve_next(FetchOutcome::Image(test_image()));
        layer.poll_request(&record);
        assert_eq!(record.credits().len(), 1);
    }
}
