// SPDX-License-Identifier: MIT OR Apache-2.0

mod opt;

use anyhow::{bail, Context, Result};
use clap::Parser;
use opt::{Action, CheckMode, CheckOpt, FixtureOpt, Opt, RunOpt, SignOpt};
use std::time::Duration;
use uefi_boot_check::console::{self, Check, Expected};
use uefi_boot_check::fixture::RemovableMedia;
use uefi_boot_check::platform;
use uefi_boot_check::qemu::QemuCommand;
use uefi_boot_check::scenario::{self, LoaderPaths, Report, Runner};
use uefi_boot_check::sign::Signer;

fn runner(opt: &Opt) -> Runner {
    Runner {
        firmware_dir: opt.firmware_dir.clone(),
        loaders: LoaderPaths {
            shim_dir: opt.shim_dir.clone(),
            grub_dir: opt.grub_dir.clone(),
        },
        timeout: Duration::from_secs(opt.timeout),
        echo: !opt.no_echo,
    }
}

fn run_scenarios(opt: &Opt, run_opt: &RunOpt) -> Result<()> {
    if !platform::has_kvm() {
        log::warn!("KVM is not available, firmware will boot under emulation");
    }

    let runner = runner(opt);
    let scenarios: Vec<_> = scenario::select(run_opt.filter.as_deref())
        .filter(|s| run_opt.machine.map_or(true, |m| s.machine == m))
        .filter(|s| run_opt.variant.map_or(true, |v| s.variant == Some(v)))
        .filter(|s| run_opt.flash_size.map_or(true, |f| s.flash_size == f))
        .collect();
    if scenarios.is_empty() {
        bail!("no scenario matches the given options");
    }

    let mut failures = 0;
    for scenario in &scenarios {
        let report = runner.report(scenario);
        match &report {
            Report::Passed(outcome) => println!("PASS {}: {outcome}", scenario.name),
            Report::Failed(reason) => println!("FAIL {}: {reason}", scenario.name),
            Report::Skipped(reason) => println!("SKIP {}: {reason}", scenario.name),
        }
        if report.is_failure() {
            failures += 1;
        }
    }

    if failures > 0 {
        bail!("{failures} of {} scenarios failed", scenarios.len());
    }
    Ok(())
}

fn check(opt: &Opt, check_opt: &CheckOpt) -> Result<()> {
    let mut qemu = QemuCommand::from_argv(check_opt.command.clone());
    for disk in &check_opt.disks {
        qemu.add_disk(disk);
    }

    let (mut check, expected) = match check_opt.mode {
        CheckMode::Shell => (Check::boot_to_shell(), Expected::Boot),
        CheckMode::SecureBoot => {
            let expected = check_opt
                .expect
                .context("--expect is required in secure-boot mode")?;
            (Check::secure_boot(check_opt.arch), expected.into())
        }
    };

    let outcome = console::verify(
        qemu.command(),
        &mut check,
        Duration::from_secs(opt.timeout),
        !opt.no_echo,
    )?;
    println!("{outcome}");
    outcome.expect(expected)?;
    Ok(())
}

fn build_fixture(fixture_opt: &FixtureOpt) -> Result<()> {
    let media = RemovableMedia::build(
        fixture_opt.arch,
        &fixture_opt.first_stage,
        &fixture_opt.second_stage,
    )?;
    fs_err::copy(media.path(), &fixture_opt.output)?;
    println!("{}", fixture_opt.output.display());
    Ok(())
}

fn sign(sign_opt: &SignOpt) -> Result<()> {
    let signed = Signer::new(&sign_opt.out_dir).sign(
        &sign_opt.input,
        &sign_opt.key,
        &sign_opt.cert,
        &sign_opt.label,
    )?;
    println!("{}", signed.path().display());
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opt = Opt::parse();

    match &opt.action {
        Action::Run(run_opt) => run_scenarios(&opt, run_opt),
        Action::Check(check_opt) => check(&opt, check_opt),
        Action::Fixture(fixture_opt) => build_fixture(fixture_opt),
        Action::Sign(sign_opt) => sign(sign_opt),
    }
}
