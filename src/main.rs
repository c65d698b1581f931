use std::{process, sync::Arc};

use staticplus::{
    application::{
        build::{
            BuildEvent, Builder, BuilderConfig, BuilderControl, BuilderHandle, SequentialIds,
            TemplateSpec,
        },
        error::{BuildError, ErrorReport},
        site::Site,
    },
    config,
    infra::{
        output::{OutputHandle, Target},
        store::{CouchConnector, StoreConnector},
        telemetry,
    },
};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{Dispatch, Level, debug, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;
use url::Url;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &BuildError) {
    let report = ErrorReport::from_error(error);
    if dispatcher::has_been_set() {
        error!(
            error_kind = report.kind.as_str(),
            error = %report.causes(),
            "application error"
        );
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(
            error_kind = report.kind.as_str(),
            error = %report.causes(),
            "application error"
        );
    });
}

async fn run() -> Result<(), BuildError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| BuildError::validation(format!("failed to load configuration: {err}")))?;

    telemetry::init(&settings.logging)?;
    let connector: Arc<dyn StoreConnector> =
        Arc::new(CouchConnector::new(settings.store.credentials.clone())?);

    match cli_args.command {
        config::Command::Site(args) => run_site(settings, *args, connector).await,
        config::Command::Build(args) => run_build(settings, args, connector).await,
    }
}

async fn run_site(
    settings: config::Settings,
    args: config::SiteArgs,
    connector: Arc<dyn StoreConnector>,
) -> Result<(), BuildError> {
    if args.watch && args.publish.is_none() {
        return Err(BuildError::validation("--watch needs --publish"));
    }
    let server = Url::parse(&args.store_url).map_err(|err| {
        BuildError::validation(format!("Bad store URL {}: {err}", args.store_url))
    })?;
    let site = Site::connect(
        settings.site(server, &args.database, &args.hostname),
        connector.as_ref(),
    )?;
    site.prepare().await?;

    if args.promote {
        return site.request_promotion().await;
    }
    if let Some(dir) = &args.seed {
        site.seed(dir).await?;
    }
    if let Some(dir) = &args.publish {
        site.publish_dir(dir).await?;
    }

    let builder = Builder::new(site.builder_config(), connector, &SequentialIds::new())?;
    let handle = start(builder);
    let control = handle.control();
    let wait = handle.wait();
    tokio::pin!(wait);

    if let (Some(dir), true) = (&args.publish, args.watch) {
        let mut watcher = site.watch(dir)?;
        tokio::select! {
            result = &mut wait => return result,
            result = site.follow(&mut watcher) => {
                control.stop(Some("resource watcher closed".to_string()));
                result?;
            }
        }
    }

    wait.await
}

async fn run_build(
    settings: config::Settings,
    args: config::BuildArgs,
    connector: Arc<dyn StoreConnector>,
) -> Result<(), BuildError> {
    let mut config = BuilderConfig::new(
        Target::parse(&args.output),
        TemplateSpec::File(args.template),
    )
    .with_source(args.source);
    config.render_failure = settings.build.render_failure;
    config.deleted = settings.build.deleted;
    config.max_attempts = settings.build.max_attempts;
    config.feed = settings.feed_options();
    config.autostop = args.autostop;

    let builder = Builder::new(config, connector, &SequentialIds::new())?;
    start(builder).wait().await
}

/// Starts `builder` with event logging and Ctrl-C handling attached.
fn start(builder: Builder) -> BuilderHandle {
    let events = builder.subscribe();
    let handle = builder.start();
    tokio::spawn(log_events(events));
    tokio::spawn(stop_on_interrupt(handle.control()));
    handle
}

async fn stop_on_interrupt(control: BuilderControl) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!(target = "staticplus::main", "interrupted; stopping builder");
        control.stop(Some("interrupted".to_string()));
    }
}

async fn log_events(mut events: broadcast::Receiver<BuildEvent>) {
    loop {
        match events.recv().await {
            Ok(BuildEvent::Page { id }) => {
                debug!(target = "staticplus::main", page = %id, "page published");
            }
            Ok(BuildEvent::Deploy(handle)) => match handle {
                OutputHandle::Memory(output) => {
                    info!(target = "staticplus::main", pages = output.len(), "deployed");
                }
                OutputHandle::Directory(path) => {
                    info!(target = "staticplus::main", dir = %path.display(), "deployed");
                }
                OutputHandle::Remote { url, document } => {
                    info!(target = "staticplus::main", url = %url, document = %document, "deployed");
                }
            },
            Ok(BuildEvent::Promoted(promotion)) => info!(
                target = "staticplus::main",
                staging_rev = %promotion.staging_rev,
                production_rev = %promotion.production_rev,
                promoted_at = %promotion.promoted_at,
                "promoted"
            ),
            Ok(BuildEvent::Died { error: Some(error) }) => {
                warn!(target = "staticplus::main", error = %error, "builder died");
                break;
            }
            Ok(BuildEvent::Died { error: None }) => break,
            Ok(event) => debug!(target = "staticplus::main", event = event.name(), "builder event"),
            Err(RecvError::Lagged(skipped)) => {
                warn!(target = "staticplus::main", skipped, "event log fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
