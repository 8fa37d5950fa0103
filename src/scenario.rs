// SPDX-License-Identifier: MIT OR Apache-2.0

//! The boot scenarios run against installed firmware builds.

use crate::arch::EfiArch;
use crate::console::{self, Check, Expected, Outcome};
use crate::error::Result;
use crate::fixture::RemovableMedia;
use crate::qemu::{FlashSize, Machine, QemuCommand, Variant};
use std::path::PathBuf;
use std::time::Duration;

/// What a scenario checks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScenarioKind {
    /// Boot to the UEFI shell.
    BootToShell,
    /// Boot shim and GRUB from removable media with Secure Boot
    /// enforced. Signed loaders must reach GRUB; unsigned ones must be
    /// refused.
    SecureBoot { arch: EfiArch, signed: bool },
}

#[derive(Clone, Copy, Debug)]
pub struct Scenario {
    pub name: &'static str,
    pub machine: Machine,
    pub variant: Option<Variant>,
    pub flash_size: FlashSize,
    pub kind: ScenarioKind,
}

const fn boot(
    name: &'static str,
    machine: Machine,
    variant: Option<Variant>,
    flash_size: FlashSize,
) -> Scenario {
    Scenario {
        name,
        machine,
        variant,
        flash_size,
        kind: ScenarioKind::BootToShell,
    }
}

const fn secure_boot(
    name: &'static str,
    machine: Machine,
    flash_size: FlashSize,
    arch: EfiArch,
    signed: bool,
) -> Scenario {
    Scenario {
        name,
        machine,
        variant: Some(Variant::Ms),
        flash_size,
        kind: ScenarioKind::SecureBoot { arch, signed },
    }
}

use crate::qemu::FlashSize::{Default as DefaultSize, Size2MB, Size4MB};
use crate::qemu::Machine::{Aavmf, Aavmf32, Ovmf32, OvmfPc, OvmfQ35};
use crate::qemu::Variant::{Ms, Secboot, Snakeoil};

pub const SCENARIOS: &[Scenario] = &[
    boot("aavmf", Aavmf, None, DefaultSize),
    secure_boot("aavmf_ms_secure_boot_signed", Aavmf, DefaultSize, EfiArch::AA64, true),
    secure_boot("aavmf_ms_secure_boot_unsigned", Aavmf, DefaultSize, EfiArch::AA64, false),
    boot("aavmf_snakeoil", Aavmf, Some(Snakeoil), DefaultSize),
    boot("aavmf32", Aavmf32, None, DefaultSize),
    boot("ovmf_pc", OvmfPc, None, Size2MB),
    boot("ovmf_q35", OvmfQ35, None, Size2MB),
    boot("ovmf_secboot", OvmfQ35, Some(Secboot), Size2MB),
    boot("ovmf_ms", OvmfQ35, Some(Ms), Size2MB),
    secure_boot("ovmf_ms_secure_boot_signed", OvmfQ35, Size2MB, EfiArch::X64, true),
    secure_boot("ovmf_ms_secure_boot_unsigned", OvmfQ35, Size2MB, EfiArch::X64, false),
    boot("ovmf_4m", OvmfQ35, None, Size4MB),
    boot("ovmf_4m_secboot", OvmfQ35, Some(Secboot), Size4MB),
    boot("ovmf_4m_ms", OvmfQ35, Some(Ms), Size4MB),
    boot("ovmf_snakeoil", OvmfQ35, Some(Snakeoil), DefaultSize),
    secure_boot("ovmf_4m_ms_secure_boot_signed", OvmfQ35, Size4MB, EfiArch::X64, true),
    secure_boot("ovmf_4m_ms_secure_boot_unsigned", OvmfQ35, Size4MB, EfiArch::X64, false),
    boot("ovmf32_4m_secboot", Ovmf32, Some(Secboot), Size4MB),
];

impl Scenario {
    pub fn expected(&self) -> Expected {
        match self.kind {
            ScenarioKind::BootToShell => Expected::Boot,
            ScenarioKind::SecureBoot { signed: true, .. } => Expected::Verified,
            ScenarioKind::SecureBoot { signed: false, .. } => Expected::Rejected,
        }
    }

    /// Host architecture needed to run the scenario. The loaders are
    /// only installed for the native architecture.
    pub fn required_host(&self) -> Option<EfiArch> {
        match self.kind {
            ScenarioKind::BootToShell => None,
            ScenarioKind::SecureBoot { arch, .. } => Some(arch),
        }
    }
}

/// Installed locations of the shim and GRUB binaries.
#[derive(Clone, Debug)]
pub struct LoaderPaths {
    pub shim_dir: PathBuf,
    pub grub_dir: PathBuf,
}

impl Default for LoaderPaths {
    fn default() -> Self {
        Self {
            shim_dir: "/usr/lib/shim".into(),
            grub_dir: "/usr/lib/grub".into(),
        }
    }
}

impl LoaderPaths {
    fn efi_ext(signed: bool) -> &'static str {
        if signed {
            "efi.signed"
        } else {
            "efi"
        }
    }

    /// First-stage loader, e.g. `shimx64.efi.signed`.
    pub fn shim(&self, arch: EfiArch, signed: bool) -> PathBuf {
        self.shim_dir
            .join(format!("shim{}.{}", arch.lower(), Self::efi_ext(signed)))
    }

    /// Second-stage loader. The unsigned build is the monolithic image
    /// that carries its own modules.
    pub fn grub(&self, arch: EfiArch, signed: bool) -> PathBuf {
        let file = format!("grub{}.{}", arch.lower(), Self::efi_ext(signed));
        if signed {
            self.grub_dir
                .join(format!("{}-efi-signed", arch.grub_arch()))
                .join(file)
        } else {
            self.grub_dir
                .join(format!("{}-efi", arch.grub_arch()))
                .join("monolithic")
                .join(file)
        }
    }
}

/// Settings shared by every scenario in a run.
#[derive(Clone, Debug)]
pub struct Runner {
    pub firmware_dir: PathBuf,
    pub loaders: LoaderPaths,
    pub timeout: Duration,
    pub echo: bool,
}

/// What happened to one scenario.
#[derive(Debug)]
pub enum Report {
    Passed(Outcome),
    Failed(String),
    Skipped(String),
}

impl Report {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl Runner {
    /// Run `scenario`, returning the outcome of the console check.
    ///
    /// Errors building the command or the fixture are returned as
    /// errors; a wrong outcome is not an error here.
    pub fn run(&self, scenario: &Scenario) -> Result<Outcome> {
        log::info!("running {}", scenario.name);
        let mut qemu = QemuCommand::new(
            &self.firmware_dir,
            scenario.machine,
            scenario.variant,
            scenario.flash_size,
        )?;

        let (mut check, _media) = match scenario.kind {
            ScenarioKind::BootToShell => (Check::boot_to_shell(), None),
            ScenarioKind::SecureBoot { arch, signed } => {
                let media = RemovableMedia::build(
                    arch,
                    &self.loaders.shim(arch, signed),
                    &self.loaders.grub(arch, signed),
                )?;
                qemu.add_disk(media.path());
                (Check::secure_boot(arch), Some(media))
            }
        };

        console::verify(qemu.command(), &mut check, self.timeout, self.echo)
    }

    /// Run `scenario` and compare against its expected outcome.
    pub fn report(&self, scenario: &Scenario) -> Report {
        if let Some(arch) = scenario.required_host() {
            if EfiArch::host() != Some(arch) {
                return Report::Skipped(format!("requires a {} host", arch.grub_arch()));
            }
        }

        match self.run(scenario) {
            Ok(outcome) => match outcome.clone().expect(scenario.expected()) {
                Ok(()) => Report::Passed(outcome),
                Err(err) => Report::Failed(err.to_string()),
            },
            Err(err) => Report::Failed(error_chain(&err)),
        }
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(err) = source {
        message.push_str(": ");
        message.push_str(&err.to_string());
        source = err.source();
    }
    message
}

/// Scenarios whose name contains `filter`, or all of them.
pub fn select(filter: Option<&str>) -> impl Iterator<Item = &'static Scenario> + '_ {
    SCENARIOS
        .iter()
        .filter(move |s| filter.map_or(true, |f| s.name.contains(f)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_loader_paths() {
        let loaders = LoaderPaths::default();
        assert_eq!(
            loaders.shim(EfiArch::X64, true),
            Path::new("/usr/lib/shim/shimx64.efi.signed")
        );
        assert_eq!(
            loaders.shim(EfiArch::AA64, false),
            Path::new("/usr/lib/shim/shimaa64.efi")
        );
        assert_eq!(
            loaders.grub(EfiArch::X64, true),
            Path::new("/usr/lib/grub/x86_64-efi-signed/grubx64.efi.signed")
        );
        assert_eq!(
            loaders.grub(EfiArch::AA64, false),
            Path::new("/usr/lib/grub/arm64-efi/monolithic/grubaa64.efi")
        );
    }

    #[test]
    fn test_scenario_names_are_unique() {
        let mut names: Vec<_> = SCENARIOS.iter().map(|s| s.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), SCENARIOS.len());
    }

    #[test]
    fn test_expected() {
        let signed = SCENARIOS
            .iter()
            .find(|s| s.name == "ovmf_ms_secure_boot_signed")
            .unwrap();
        assert_eq!(signed.expected(), Expected::Verified);
        assert_eq!(signed.required_host(), Some(EfiArch::X64));

        let unsigned = SCENARIOS
            .iter()
            .find(|s| s.name == "aavmf_ms_secure_boot_unsigned")
            .unwrap();
        assert_eq!(unsigned.expected(), Expected::Rejected);

        assert!(SCENARIOS
            .iter()
            .filter(|s| s.kind == ScenarioKind::BootToShell)
            .all(|s| s.expected() == Expected::Boot && s.required_host().is_none()));
    }

    #[test]
    fn test_select() {
        assert_eq!(select(None).count(), SCENARIOS.len());
        let aavmf: Vec<_> = select(Some("aavmf")).map(|s| s.name).collect();
        assert_eq!(
            aavmf,
            [
                "aavmf",
                "aavmf_ms_secure_boot_signed",
                "aavmf_ms_secure_boot_unsigned",
                "aavmf_snakeoil",
                "aavmf32"
            ]
        );
    }

    #[test]
    fn test_missing_firmware_fails_scenario() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = Runner {
            firmware_dir: dir.path().to_path_buf(),
            loaders: LoaderPaths::default(),
            timeout: Duration::from_secs(1),
            echo: false,
        };
        let report = runner.report(&SCENARIOS[0]);
        match report {
            Report::Failed(message) => assert!(message.contains("firmware file does not exist")),
            other => panic!("unexpected report: {other:?}"),
        }
    }
}
