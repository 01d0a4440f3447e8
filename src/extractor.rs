use crate::chart::{Chart, ChartType, RenderOutcome};
use crate::operator::OperatorConfig;
use crate::renderer::RenderResult;
use crate::{manifest_scanner, values_scanner};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const MAX_WORKERS: usize = 32;

/// Candidate or final image references.
pub type ImageSet = BTreeSet<String>;

/// Memoises per-chart scan results by chart path.
#[derive(Debug, Default)]
pub struct ScanCache {
    entries: Mutex<HashMap<PathBuf, Arc<ImageSet>>>,
}

impl ScanCache {
    /// Returns the stored result for `path`, scanning on a miss.
    ///
    /// The scan runs without holding the lock, so two workers missing on the
    /// same path at once may both scan it. Only the first result is stored
    /// and both callers get that one.
    pub fn get_or_scan(&self, path: &Path, scan: impl FnOnce() -> ImageSet) -> Arc<ImageSet> {
        if let Some(cached) = self.lock().get(path) {
            debug!(path = %path.display(), "Using cached scan result");
            return Arc::clone(cached);
        }

        let scanned = Arc::new(scan());
        Arc::clone(
            self.lock()
                .entry(path.to_path_buf())
                .or_insert(scanned),
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Arc<ImageSet>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One unit of work for the extraction workers.
#[derive(Debug)]
pub enum ScanJob {
    Manifest { chart: Arc<Chart>, manifest: String },
    Values { chart: Arc<Chart> },
    OperatorRules { chart: Arc<Chart> },
}

impl ScanJob {
    fn chart(&self) -> &Chart {
        match self {
            ScanJob::Manifest { chart, .. }
            | ScanJob::Values { chart }
            | ScanJob::OperatorRules { chart } => chart,
        }
    }

    fn source(&self) -> &'static str {
        match self {
            ScanJob::Manifest { .. } => "manifest",
            ScanJob::Values { .. } => "values",
            ScanJob::OperatorRules { .. } => "operator",
        }
    }
}

struct ScanContext {
    operators: OperatorConfig,
    max_depth: usize,
    cache: Option<Arc<ScanCache>>,
}

impl ScanContext {
    fn scan(&self, job: &ScanJob) -> ImageSet {
        match job {
            ScanJob::Manifest { chart, manifest } => {
                self.cached(chart, || manifest_scanner::scan(manifest))
            }
            ScanJob::Values { chart } => {
                self.cached(chart, || values_scanner::scan(&chart.values, self.max_depth))
            }
            ScanJob::OperatorRules { chart } => self.operators.extract(&chart.name, &chart.values),
        }
    }

    fn cached(&self, chart: &Chart, scan: impl FnOnce() -> ImageSet) -> ImageSet {
        match &self.cache {
            Some(cache) => cache.get_or_scan(&chart.path, scan).as_ref().clone(),
            None => scan(),
        }
    }
}

/// Collects candidate images from rendered manifests, chart values and
/// operator rules using a fixed pool of workers.
pub struct Extractor {
    context: Arc<ScanContext>,
    workers: usize,
}

impl Extractor {
    pub fn new(operators: OperatorConfig, workers: usize, max_depth: usize) -> Self {
        Self {
            context: Arc::new(ScanContext {
                operators,
                max_depth,
                cache: None,
            }),
            workers: workers.clamp(1, MAX_WORKERS),
        }
    }

    pub fn with_cache(self, cache: Arc<ScanCache>) -> Self {
        let context = ScanContext {
            operators: self.context.operators.clone(),
            max_depth: self.context.max_depth,
            cache: Some(cache),
        };
        Self {
            context: Arc::new(context),
            workers: self.workers,
        }
    }

    /// Decides which scans run for which chart.
    ///
    /// Rendered charts are scanned from their manifests, failed renders fall
    /// back to their values, charts that were never rendered are scanned from
    /// their values too, and operator charts always get their rules applied.
    pub fn plan(results: Vec<RenderResult>, charts: &[Arc<Chart>]) -> Vec<ScanJob> {
        let mut jobs = Vec::new();
        let mut rendered = HashSet::new();
        let mut values_queued = HashSet::new();

        for result in results {
            match result.outcome {
                RenderOutcome::Rendered(manifest) => {
                    rendered.insert(result.chart.name.clone());
                    jobs.push(ScanJob::Manifest {
                        chart: result.chart,
                        manifest,
                    });
                }
                RenderOutcome::Failed(cause) => {
                    debug!(chart = %result.chart.name, %cause, "Render failed, using values fallback");
                    values_queued.insert(result.chart.name.clone());
                    jobs.push(ScanJob::Values {
                        chart: result.chart,
                    });
                }
            }
        }

        for chart in charts {
            if rendered.contains(&chart.name) {
                continue;
            }
            if values_queued.insert(chart.name.clone()) {
                jobs.push(ScanJob::Values {
                    chart: Arc::clone(chart),
                });
            }
        }

        for chart in charts {
            if chart.chart_type == ChartType::Operator {
                jobs.push(ScanJob::OperatorRules {
                    chart: Arc::clone(chart),
                });
            }
        }

        jobs
    }

    pub async fn extract(&self, results: Vec<RenderResult>, charts: &[Arc<Chart>]) -> ImageSet {
        let jobs = Self::plan(results, charts);
        info!("Extracting images with {} scans on {} workers", jobs.len(), self.workers);

        let (tx, rx) = mpsc::channel::<ScanJob>(self.workers);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let images = Arc::new(Mutex::new(ImageSet::new()));

        let handles: Vec<_> = (0..self.workers)
            .map(|_| {
                let rx = Arc::clone(&rx);
                let images = Arc::clone(&images);
                let context = Arc::clone(&self.context);
                tokio::spawn(async move {
                    loop {
                        let Some(job) = rx.lock().await.recv().await else {
                            break;
                        };
                        let found = context.scan(&job);
                        debug!(
                            chart = %job.chart().name,
                            source = job.source(),
                            count = found.len(),
                            "Scanned chart"
                        );
                        images
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .extend(found);
                    }
                })
            })
            .collect();

        for job in jobs {
            if tx.send(job).await.is_err() {
                warn!("All extraction workers stopped, remaining scans skipped");
                break;
            }
        }
        drop(tx);

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!("Extraction worker failed: {}", e);
            }
        }

        let images = std::mem::take(&mut *images.lock().unwrap_or_else(PoisonError::into_inner));
        info!("Extracted {} candidate images", images.len());
        images
    }
}
