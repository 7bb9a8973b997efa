use lambay_core::installer::PackageRequest;
use lambay_core::resolver::topo_order;
use lambay_core::{EngineConfig, Installer, Manifest, PackageSpec, RegistryClient, Resolver};
use miette::{miette, IntoDiagnostic, Result};
use std::path::Path;
use std::time::Instant;
use tracing::info;

pub async fn run(
    cwd: &Path,
    package: Option<&str>,
    dev: bool,
    concurrency: usize,
) -> Result<()> {
    let config = EngineConfig::from_env().with_concurrency(concurrency);
    let installer = Installer::new(&config, cwd).into_diagnostic()?;

    match package {
        Some(arg) => install_single(&installer, arg).await,
        None => install_from_manifest(&config, &installer, cwd, dev).await,
    }
}

async fn install_single(installer: &Installer, arg: &str) -> Result<()> {
    let spec = PackageSpec::parse(arg).into_diagnostic()?;
    let started = Instant::now();

    let version = installer
        .install_one(&spec.name, spec.range_or_latest())
        .await
        .into_diagnostic()?;

    println!(
        "installed {}@{version} in {:.2?}",
        spec.name,
        started.elapsed()
    );
    Ok(())
}

async fn install_from_manifest(
    config: &EngineConfig,
    installer: &Installer,
    cwd: &Path,
    dev: bool,
) -> Result<()> {
    let manifest = Manifest::read(&cwd.join(lambay_core::MANIFEST_NAME)).into_diagnostic()?;
    if !manifest.has_dependencies() {
        println!("no dependencies to install");
        return Ok(());
    }

    let started = Instant::now();
    let roots = manifest.root_specs(dev);
    info!(requirements = roots.len(), "resolving dependency graph");

    let registry = RegistryClient::from_config(config).into_diagnostic()?;
    let resolver = Resolver::new(registry, config.resolve_workers);
    let outcome = resolver.build_graph(&roots).await;

    let order = topo_order(&outcome.graph);
    info!(packages = order.len(), "dependency graph resolved");

    let requests: Vec<PackageRequest> = order.iter().map(|node| PackageRequest::from(*node)).collect();
    let report = installer.install_all(&requests).await.into_diagnostic()?;

    // Resolve failures leave their subtrees uninstalled; everything else
    // has been driven to completion, so report them now and exit non-zero.
    if !outcome.failures.is_empty() {
        for failure in &outcome.failures {
            eprintln!(
                "failed to resolve {}@{}: {}",
                failure.name, failure.spec, failure.error
            );
        }
        return Err(miette!(
            "{} of {} requirements failed to resolve",
            outcome.failures.len(),
            outcome.failures.len() + outcome.graph.len()
        ));
    }

    println!(
        "installed {} packages ({} already up to date) in {:.2?}",
        report.packages.len(),
        report.skipped_count(),
        started.elapsed()
    );
    Ok(())
}
