//! Upload command implementation.

use anyhow::{Context, Result};
use console::style;
use espupload::{
    Bootloader, FileSource, FinishAction, FirmwareSource, FlashParams, NativePort, SystemClock,
    UploadConfig, UploadError, UploadSession, UploadTarget,
};
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use std::path::PathBuf;

use crate::config::Config;
use crate::{Cli, CliError, get_port, resolve_baud, use_fancy_output, was_interrupted};

/// Options of one `upload` invocation, already converted to library types.
#[derive(Debug, Clone, Default)]
pub(crate) struct UploadArgs {
    pub(crate) file: Option<PathBuf>,
    pub(crate) target: Option<UploadTarget>,
    pub(crate) address: Option<u32>,
    pub(crate) finish: Option<FinishAction>,
    pub(crate) no_reset: bool,
    pub(crate) flash_params: Option<FlashParams>,
}

/// Everything needed to start a session, with config defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UploadPlan {
    pub(crate) file: PathBuf,
    pub(crate) target: UploadTarget,
    pub(crate) address: u32,
    pub(crate) session: UploadConfig,
}

impl UploadPlan {
    /// Flags win over the config file, which wins over built-in defaults.
    pub(crate) fn resolve(args: &UploadArgs, config: &Config, baud: u32) -> Self {
        let target = args
            .target
            .or(config.upload.target)
            .unwrap_or_default();
        let file = args
            .file
            .clone()
            .unwrap_or_else(|| PathBuf::from(target.default_file_name()));
        let reset_after = !args.no_reset && config.upload.reset_after.unwrap_or(true);

        Self {
            file,
            target,
            address: args.address.unwrap_or_else(|| target.address()),
            session: UploadConfig::default()
                .with_baud_rate(baud)
                .with_finish(args.finish.or(config.upload.finish).unwrap_or_default())
                .with_flash_params(args.flash_params.or(config.upload.flash_params))
                .with_reset_after(reset_after),
        }
    }
}

fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Upload command implementation.
pub(crate) fn cmd_upload(cli: &Cli, config: &mut Config, args: &UploadArgs) -> Result<()> {
    let baud = resolve_baud(cli, config)?;
    let plan = UploadPlan::resolve(args, config, baud);
    debug!("Upload plan: {plan:?}");

    if !cli.quiet {
        eprintln!(
            "{} Loading {} image {}",
            style("📦").cyan(),
            plan.target,
            plan.file.display()
        );
    }

    let source = FileSource::open(&plan.file)
        .with_context(|| format!("Failed to open image {}", plan.file.display()))?;
    if source.size() == 0 {
        return Err(espupload::Error::from(UploadError::EmptyFile))
            .with_context(|| format!("Cannot upload {}", plan.file.display()));
    }

    let port_name = get_port(cli, config)?;
    if !cli.quiet {
        eprintln!(
            "{} Using port {port_name} at {baud} baud",
            style("🔌").cyan()
        );
    }

    let port = NativePort::open_simple(&port_name, baud)
        .with_context(|| format!("Failed to open serial port {port_name}"))?;
    let mut session = UploadSession::new(Bootloader::new(port, SystemClock), plan.session);

    session
        .start(Box::new(source), plan.address)
        .with_context(|| format!("Cannot upload {}", plan.file.display()))?;

    if !cli.quiet {
        eprintln!(
            "{} Resetting module into the loader, writing {} blocks to 0x{:06X}",
            style("⏳").yellow(),
            session.total_blocks(),
            plan.address
        );
    }

    let pb = progress_bar(cli.quiet);
    pb.set_message(plan.target.name());
    let outcome = session.run(|percent| pb.set_position(u64::from(percent)));
    if let Err(e) = session.close() {
        debug!("Closing {port_name} failed: {e}");
    }

    match outcome {
        Ok(()) => {
            pb.finish_with_message("done");
            if !cli.quiet {
                eprintln!(
                    "\n{} Uploaded {} bytes",
                    style("🎉").green().bold(),
                    session.file_size()
                );
            }
            Ok(())
        },
        Err(UploadError::Cancelled) if was_interrupted() => {
            pb.abandon();
            Err(CliError::Cancelled("Upload interrupted".to_string()).into())
        },
        Err(e) => {
            pb.abandon();
            Err(anyhow::Error::new(e).context(format!(
                "Upload failed after {} of {} blocks",
                session.current_block(),
                session.total_blocks()
            )))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_defaults_to_firmware() {
        let plan = UploadPlan::resolve(&UploadArgs::default(), &Config::default(), 115_200);
        assert_eq!(plan.target, UploadTarget::Firmware);
        assert_eq!(plan.file, PathBuf::from("MksWifi.bin"));
        assert_eq!(plan.address, 0);
        assert_eq!(plan.session.baud_rate, 115_200);
        assert_eq!(plan.session.finish, FinishAction::Skip);
        assert!(plan.session.reset_after);
        assert!(plan.session.flash_params.is_none());
    }

    #[test]
    fn test_plan_uses_target_address_and_file_name() {
        let args = UploadArgs {
            target: Some(UploadTarget::WebFiles),
            ..UploadArgs::default()
        };
        let plan = UploadPlan::resolve(&args, &Config::default(), 460_800);
        assert_eq!(plan.file, PathBuf::from("MksWifiWeb.bin"));
        assert_eq!(plan.address, 0x10_0000);
        assert_eq!(plan.session.baud_rate, 460_800);
    }

    #[test]
    fn test_plan_flags_override_config() {
        let mut config = Config::default();
        config.upload.target = Some(UploadTarget::WebFiles);
        config.upload.finish = Some(FinishAction::Stay);
        config.upload.flash_params = Some(FlashParams {
            value: 0x0020,
            mask: 0x00F0,
        });

        let from_config = UploadPlan::resolve(&UploadArgs::default(), &config, 115_200);
        assert_eq!(from_config.target, UploadTarget::WebFiles);
        assert_eq!(from_config.session.finish, FinishAction::Stay);
        assert_eq!(
            from_config.session.flash_params,
            config.upload.flash_params
        );

        let args = UploadArgs {
            file: Some(PathBuf::from("custom.bin")),
            target: Some(UploadTarget::WebFirmware),
            address: Some(0x8_0000),
            finish: Some(FinishAction::Reboot),
            no_reset: false,
            flash_params: Some(FlashParams {
                value: 0x0220,
                mask: 0xFFFF,
            }),
        };
        let plan = UploadPlan::resolve(&args, &config, 115_200);
        assert_eq!(plan.file, PathBuf::from("custom.bin"));
        assert_eq!(plan.target, UploadTarget::WebFirmware);
        assert_eq!(plan.address, 0x8_0000);
        assert_eq!(plan.session.finish, FinishAction::Reboot);
        assert_eq!(plan.session.flash_params, args.flash_params);
    }

    #[test]
    fn test_plan_reset_after() {
        let mut config = Config::default();
        let args = UploadArgs {
            no_reset: true,
            ..UploadArgs::default()
        };
        assert!(!UploadPlan::resolve(&args, &config, 115_200).session.reset_after);

        config.upload.reset_after = Some(false);
        assert!(
            !UploadPlan::resolve(&UploadArgs::default(), &config, 115_200)
                .session
                .reset_after
        );
    }
}
