//! Installation state machine.
//!
//! ```text
//!   (no record) / not-installed ─┐
//!                                ├─ first install ─→ started ─→ installed
//!   started ─────────────────────┘                                 │
//!   upgraded ─ legacy migration ─→ installed ──────────────────────┤
//!                                                                  ▼
//!            validate ─→ dependency repair ─→ troubleshoot loop until valid
//! ```
//!
//! Collaborators are injected through the [`ports`] traits. The runtime
//! environment is built per record by a factory closure, since its device
//! and base path are only known once the record exists.

pub mod host;
pub mod ports;
pub mod state;
pub mod store;
pub mod validation;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub use host::DirectoryHost;
pub use ports::{InstallHost, InstallOptions, InstallUi, RuntimeOps, StateStore, TroubleshootRequest};
pub use state::{InstallRecord, InstallState, TransitionError};
pub use store::JsonStateStore;
pub use validation::{validate_installation, CheckStatus, ValidationReport};

use crate::events::tracked;

pub struct InstallationManager<S, U, H, R, F>
where
    S: StateStore,
    U: InstallUi,
    H: InstallHost,
    R: RuntimeOps,
    F: FnMut(&InstallRecord) -> R,
{
    store: S,
    ui: U,
    host: H,
    make_runtime: F,
    app_root: PathBuf,
    runtime: Option<R>,
}

impl<S, U, H, R, F> InstallationManager<S, U, H, R, F>
where
    S: StateStore,
    U: InstallUi,
    H: InstallHost,
    R: RuntimeOps,
    F: FnMut(&InstallRecord) -> R,
{
    pub fn new(store: S, ui: U, host: H, app_root: impl Into<PathBuf>, make_runtime: F) -> Self {
        Self {
            store,
            ui,
            host,
            make_runtime,
            app_root: app_root.into(),
            runtime: None,
        }
    }

    /// Environment of the installation, once `ensure_installed` has run.
    pub fn runtime(&self) -> Option<&R> {
        self.runtime.as_ref()
    }

    pub fn into_runtime(self) -> Option<R> {
        self.runtime
    }

    pub fn ui_mut(&mut self) -> &mut U {
        &mut self.ui
    }

    /// Bring the installation to a valid state; returns the final record.
    ///
    /// Validation and repair problems are routed to the UI and retried
    /// without limit. Failures of the first install itself and UI/store
    /// failures are returned.
    pub async fn ensure_installed(&mut self) -> Result<InstallRecord> {
        let loaded = self.store.load()?;
        let mut record = match loaded {
            Some(record) if record.state.is_installed() => record,
            Some(record) => {
                tracing::info!("Install state is '{}', running first install", record.state);
                self.first_install(record).await?
            }
            None => self.first_install(InstallRecord::default()).await?,
        };

        self.repair_until_valid(&mut record).await?;
        Ok(record)
    }

    // ─── First install ───────────────────────────────────────

    async fn first_install(&mut self, mut record: InstallRecord) -> Result<InstallRecord> {
        let options = self.ui.collect_options().await.context("Install options")?;
        record.base_path = Some(options.base_path.clone());
        record.device = Some(options.device);
        record.mirrors = options.mirrors.clone();
        record.migration_source = options.migration_source.clone();
        self.advance(&mut record, InstallState::Started)?;

        let result = tracked("install", self.run_first_install(&record, &options)).await;
        if let Err(e) = result {
            self.ui.report_error(&e).await;
            return Err(e);
        }

        self.advance(&mut record, InstallState::Installed)?;
        Ok(record)
    }

    async fn run_first_install(&mut self, record: &InstallRecord, options: &InstallOptions) -> Result<()> {
        let base = options.base_path.as_path();
        self.host
            .prepare_directories(base)
            .await
            .context("Failed to prepare directories")?;

        let mut runtime = (self.make_runtime)(record);
        runtime
            .create()
            .await
            .context("Failed to create the Python environment")?;
        self.runtime = Some(runtime);

        if let Some(source) = options.migration_source.as_deref() {
            // missing user data is not worth failing the install for
            if let Err(e) = self.host.migrate_user_data(source, base).await {
                tracing::warn!("User data migration from {} failed: {:#}", source.display(), e);
                self.ui.report_error(&e).await;
            }
        }
        Ok(())
    }

    // ─── Existing install ────────────────────────────────────

    async fn repair_until_valid(&mut self, record: &mut InstallRecord) -> Result<()> {
        let mut runtime = match self.runtime.take() {
            Some(runtime) => runtime,
            None => (self.make_runtime)(record),
        };

        if record.state == InstallState::Upgraded {
            self.run_legacy_migration(record).await?;
        }

        let mut report = self.validate(record, &runtime).await;

        if report.needs_package_upgrade() {
            tracing::info!("Dependency update detected, reinstalling requirements");
            let repaired = tracked("update_requirements", runtime.reinstall_requirements()).await;
            if let Err(e) = repaired {
                self.ui.report_error(&anyhow::Error::new(e)).await;
            }
            report = self.validate(record, &runtime).await;
        }

        while !report.is_valid() {
            self.ui.present_report(&report).await;
            let request = self.ui.wait_for_request().await?;
            tracing::info!("Troubleshooting request: {:?}", request);

            if let Err(e) = perform(&mut runtime, request).await {
                self.ui.report_error(&e).await;
            }
            report = self.validate(record, &runtime).await;
        }

        self.runtime = Some(runtime);
        Ok(())
    }

    async fn run_legacy_migration(&mut self, record: &mut InstallRecord) -> Result<()> {
        let Some(base) = record.base_path.clone() else {
            return Ok(());
        };
        let migrated = tracked("migrate_legacy_format", self.host.migrate_legacy_format(&base)).await;
        match migrated {
            Ok(()) => self.advance(record, InstallState::Installed),
            Err(e) => {
                // stays `upgraded`, retried next launch
                self.ui.report_error(&e).await;
                Ok(())
            }
        }
    }

    async fn validate(&self, record: &InstallRecord, runtime: &R) -> ValidationReport {
        validate_installation(record, &self.app_root, runtime).await
    }

    fn advance(&mut self, record: &mut InstallRecord, to: InstallState) -> Result<()> {
        record.transition(to)?;
        self.store.save(record)
    }

    pub fn app_root(&self) -> &Path {
        &self.app_root
    }
}

async fn perform<R: RuntimeOps>(runtime: &mut R, request: TroubleshootRequest) -> Result<()> {
    match request {
        TroubleshootRequest::Recheck => {}
        TroubleshootRequest::ReinstallRequirements => {
            tracked("reinstall_requirements", runtime.reinstall_requirements()).await?
        }
        TroubleshootRequest::ResetEnvironment => {
            tracked("reset_environment", runtime.recreate()).await?
        }
        TroubleshootRequest::ClearCache => tracked("clear_cache", runtime.clear_cache()).await?,
    }
    Ok(())
}
