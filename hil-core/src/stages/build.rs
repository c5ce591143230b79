//! Firmware build through the Zephyr `west` front end.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::Settings;
use crate::env::Environment;
use crate::error::BuildFailure;
use crate::process::{Invocation, ProcessRunner};

/// Inputs of one build.
#[derive(Debug, Clone, Copy)]
pub struct BuildRequest<'a> {
    pub clean: bool,
    pub defines: &'a [String],
    pub env: &'a Environment,
    /// Root of the source tree containing the application to build.
    pub source_root: &'a Path,
    /// Directory the build runs in; the output directory is relative to it.
    pub working_dir: &'a Path,
    pub guard_time: Duration,
}

/// Build the firmware image and return the path of the hex file.
///
/// A clean build deletes the output directory first; if that fails the
/// builder is never started.
pub async fn build(
    runner: &dyn ProcessRunner,
    settings: &Settings,
    request: &BuildRequest<'_>,
) -> Result<PathBuf, BuildFailure> {
    let output_dir = request.working_dir.join(&settings.build_subdir);

    if request.clean {
        remove_output_dir(&output_dir).map_err(|source| BuildFailure::Clean {
            dir: output_dir.clone(),
            source,
        })?;
    }

    let env = build_env(request.env, request.defines);
    let invocation = Invocation::new(builder_args(settings, request.clean, request.source_root))
        .shell()
        .env(env)
        .working_dir(request.working_dir)
        .guard_time(request.guard_time);

    if runner.run(&invocation).await.success {
        Ok(artifact_path(settings, &output_dir))
    } else {
        Err(BuildFailure::Builder)
    }
}

/// `west -v build -b <board> -d <subdir> [-p always] <app>`
pub fn builder_args(settings: &Settings, clean: bool, source_root: &Path) -> Vec<String> {
    let app_dir = source_root.join(&settings.runner_dir);
    let mut args = vec![
        settings.builder.clone(),
        "-v".to_string(),
        "build".to_string(),
        "-b".to_string(),
        forward_slashes(&settings.board),
        "-d".to_string(),
        forward_slashes(&settings.build_subdir),
    ];
    if clean {
        args.push("-p".to_string());
        args.push("always".to_string());
    }
    args.push(forward_slashes(&app_dir.to_string_lossy()));
    args
}

/// The captured environment plus the build overrides.
pub fn build_env(captured: &Environment, defines: &[String]) -> Environment {
    let mut env = captured.clone();
    // ccache trips over long paths at random; builds are mostly clean anyway.
    env.set("CCACHE_DISABLE", "1");
    if !defines.is_empty() {
        let flags = define_flags(defines);
        tracing::info!(u_flags = %flags, "Setting compiler defines");
        env.set("U_FLAGS", flags);
    }
    env
}

/// `["A", "B=1"]` → `"-DA -DB=1"`
pub fn define_flags(defines: &[String]) -> String {
    defines
        .iter()
        .map(|define| format!("-D{}", define))
        .collect::<Vec<_>>()
        .join(" ")
}

/// `<output_dir>/<toolchain_subdir>/<image>`
pub fn artifact_path(settings: &Settings, output_dir: &Path) -> PathBuf {
    output_dir
        .join(&settings.toolchain_subdir)
        .join(&settings.image)
}

fn remove_output_dir(dir: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {
            tracing::info!(dir = %dir.display(), "Removed build output directory");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn forward_slashes(text: &str) -> String {
    text.replace('\\', "/")
}
