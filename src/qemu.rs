// SPDX-License-Identifier: MIT OR Apache-2.0

//! QEMU command lines for the firmware flavours under test.
//!
//! The verification code treats the result as an opaque argv; this
//! module only knows how to pick firmware files and machine flags.

use crate::error::{Error, Result};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;
#[cfg(target_os = "linux")]
use {std::fs::Permissions, std::os::unix::fs::PermissionsExt};

/// Firmware build and the machine it runs on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Machine {
    OvmfPc,
    OvmfQ35,
    Ovmf32,
    Aavmf,
    Aavmf32,
}

/// Secure Boot flavour of a firmware build.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Variant {
    /// Secure Boot capable code with empty variables.
    Secboot,
    /// Microsoft keys enrolled.
    Ms,
    /// Snakeoil test keys enrolled.
    Snakeoil,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FlashSize {
    #[default]
    Default,
    Size2MB,
    Size4MB,
}

impl Machine {
    pub fn all() -> &'static [Self] {
        &[
            Self::OvmfPc,
            Self::OvmfQ35,
            Self::Ovmf32,
            Self::Aavmf,
            Self::Aavmf32,
        ]
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::OvmfPc => "ovmf-pc",
            Self::OvmfQ35 => "ovmf-q35",
            Self::Ovmf32 => "ovmf32",
            Self::Aavmf => "aavmf",
            Self::Aavmf32 => "aavmf32",
        }
    }

    fn qemu_exe(self) -> &'static str {
        match self {
            Self::OvmfPc | Self::OvmfQ35 => "qemu-system-x86_64",
            Self::Ovmf32 => "qemu-system-i386",
            Self::Aavmf => "qemu-system-aarch64",
            Self::Aavmf32 => "qemu-system-arm",
        }
    }

    fn is_arm(self) -> bool {
        matches!(self, Self::Aavmf | Self::Aavmf32)
    }

    /// Firmware directory below the data dir and file name prefix.
    fn firmware_prefix(self) -> (&'static str, &'static str) {
        match self {
            Self::OvmfPc | Self::OvmfQ35 => ("OVMF", "OVMF"),
            Self::Ovmf32 => ("OVMF", "OVMF32"),
            Self::Aavmf => ("AAVMF", "AAVMF"),
            Self::Aavmf32 => ("AAVMF", "AAVMF32"),
        }
    }
}

impl Variant {
    fn as_str(self) -> &'static str {
        match self {
            Self::Secboot => "secboot",
            Self::Ms => "ms",
            Self::Snakeoil => "snakeoil",
        }
    }
}

impl FlashSize {
    fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Size2MB => "2m",
            Self::Size4MB => "4m",
        }
    }
}

macro_rules! impl_display_from_str {
    ($ty:ty, $all:expr) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, String> {
                $all.iter()
                    .find(|v| v.as_str() == s)
                    .copied()
                    .ok_or_else(|| format!("invalid {}: {s}", stringify!($ty)))
            }
        }
    };
}

impl_display_from_str!(Machine, Machine::all());
impl_display_from_str!(Variant, [Variant::Secboot, Variant::Ms, Variant::Snakeoil]);
impl_display_from_str!(
    FlashSize,
    [FlashSize::Default, FlashSize::Size2MB, FlashSize::Size4MB]
);

/// Code and vars images for one firmware flavour.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FirmwarePaths {
    pub code: PathBuf,
    pub vars: PathBuf,
}

impl FirmwarePaths {
    /// Locate the firmware images below `data_dir` (normally
    /// `/usr/share`), following the distribution's naming scheme.
    pub fn new(
        data_dir: &Path,
        machine: Machine,
        variant: Option<Variant>,
        flash_size: FlashSize,
    ) -> Self {
        let (dir, prefix) = machine.firmware_prefix();

        // Only OVMF comes in more than one flash size; the 4 MiB build
        // is the default.
        let size = match (machine, flash_size) {
            (Machine::OvmfPc | Machine::OvmfQ35, FlashSize::Size2MB) => "",
            (Machine::OvmfPc | Machine::OvmfQ35 | Machine::Ovmf32, _) => "_4M",
            _ => "",
        };

        let code_suffix = variant.map(|v| format!(".{}", v.as_str()));
        let vars_suffix = match variant {
            // Secure Boot capable, but nothing enrolled.
            None | Some(Variant::Secboot) => None,
            Some(v) => Some(format!(".{}", v.as_str())),
        };

        let dir = data_dir.join(dir);
        Self {
            code: dir.join(format!(
                "{prefix}_CODE{size}{}.fd",
                code_suffix.unwrap_or_default()
            )),
            vars: dir.join(format!(
                "{prefix}_VARS{size}{}.fd",
                vars_suffix.unwrap_or_default()
            )),
        }
    }

    fn check(&self) -> Result<()> {
        for path in [&self.code, &self.vars] {
            if !path.exists() {
                return Err(Error::MissingFirmware(path.clone()));
            }
        }
        Ok(())
    }
}

enum PflashMode {
    ReadOnly,
    ReadWrite,
}

fn add_pflash_args(args: &mut Vec<OsString>, file: &Path, mode: PflashMode) {
    // Build the argument as an OsString to avoid requiring a UTF-8 path.
    let mut arg = OsString::from("if=pflash,format=raw,readonly=");
    arg.push(match mode {
        PflashMode::ReadOnly => "on",
        PflashMode::ReadWrite => "off",
    });
    arg.push(",file=");
    arg.push(file);

    args.push("-drive".into());
    args.push(arg);
}

/// A VM command line, built up before spawning.
#[derive(Debug)]
pub struct QemuCommand {
    argv: Vec<OsString>,
    disks: usize,
    // Holds the writable copy of the vars image for the VM's lifetime.
    _tmp_dir: Option<TempDir>,
}

impl QemuCommand {
    /// Wrap an existing command line, e.g. one given on our command line.
    pub fn from_argv(argv: Vec<OsString>) -> Self {
        Self {
            argv,
            disks: 0,
            _tmp_dir: None,
        }
    }

    /// Build the command line for `machine` booting the given firmware.
    pub fn new(
        data_dir: &Path,
        machine: Machine,
        variant: Option<Variant>,
        flash_size: FlashSize,
    ) -> Result<Self> {
        let firmware = FirmwarePaths::new(data_dir, machine, variant, flash_size);
        firmware.check()?;

        let mut argv: Vec<OsString> = vec![machine.qemu_exe().into()];
        let mut args = |list: &[&str]| argv.extend(list.iter().map(OsString::from));

        let secure = variant.is_some();
        match machine {
            Machine::OvmfPc => args(&["-machine", "pc,accel=kvm:tcg"]),
            Machine::OvmfQ35 | Machine::Ovmf32 => {
                if secure {
                    // SMM is what protects the authenticated variables.
                    args(&["-machine", "q35,smm=on,accel=kvm:tcg"]);
                    args(&["-global", "ICH9-LPC.disable_s3=1"]);
                    args(&["-global", "driver=cfi.pflash01,property=secure,value=on"]);
                } else {
                    args(&["-machine", "q35,accel=kvm:tcg"]);
                }
            }
            Machine::Aavmf => args(&["-machine", "virt", "-cpu", "cortex-a57"]),
            Machine::Aavmf32 => args(&["-machine", "virt", "-cpu", "cortex-a15"]),
        }

        // Disable default devices, and talk to the firmware over a serial
        // console on stdio.
        args(&["-no-user-config", "-nodefaults"]);
        args(&["-m", "256", "-smp", "1"]);
        args(&["-display", "none", "-serial", "stdio"]);
        if machine.is_arm() {
            args(&["-device", "virtio-rng-pci"]);
        }

        // Make a copy of the vars file so that it can be used read+write
        // without modifying the original.
        let tmp_dir = TempDir::new()?;
        let vars = tmp_dir.path().join("vars.fd");
        fs_err::copy(&firmware.vars, &vars)?;
        // Necessary, as for example on NixOS, the files are read-only inside
        // the Nix store.
        #[cfg(target_os = "linux")]
        fs_err::set_permissions(&vars, Permissions::from_mode(0o666))?;

        add_pflash_args(&mut argv, &firmware.code, PflashMode::ReadOnly);
        add_pflash_args(&mut argv, &vars, PflashMode::ReadWrite);

        Ok(Self {
            argv,
            disks: 0,
            _tmp_dir: Some(tmp_dir),
        })
    }

    /// Attach a raw disk image as a virtio block device.
    pub fn add_disk(&mut self, path: &Path) {
        let id = format!("disk{}", self.disks);
        self.disks += 1;

        let mut drive = OsString::from("file=");
        drive.push(path);
        drive.push(format!(",format=raw,if=none,id={id}"));

        self.argv.push("-drive".into());
        self.argv.push(drive);
        self.argv.push("-device".into());
        self.argv.push(format!("virtio-blk-pci,drive={id}").into());
    }

    pub fn argv(&self) -> &[OsString] {
        &self.argv
    }

    /// A `Command` ready to hand to a console session.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(self.argv.first().cloned().unwrap_or_default());
        cmd.args(self.argv.iter().skip(1));
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::command_to_string;

    #[test]
    fn test_firmware_paths() {
        let share = Path::new("/usr/share");
        assert_eq!(
            FirmwarePaths::new(share, Machine::OvmfQ35, Some(Variant::Ms), FlashSize::Size4MB),
            FirmwarePaths {
                code: "/usr/share/OVMF/OVMF_CODE_4M.ms.fd".into(),
                vars: "/usr/share/OVMF/OVMF_VARS_4M.ms.fd".into(),
            }
        );
        assert_eq!(
            FirmwarePaths::new(share, Machine::OvmfPc, None, FlashSize::Size2MB),
            FirmwarePaths {
                code: "/usr/share/OVMF/OVMF_CODE.fd".into(),
                vars: "/usr/share/OVMF/OVMF_VARS.fd".into(),
            }
        );
        assert_eq!(
            FirmwarePaths::new(share, Machine::Ovmf32, Some(Variant::Secboot), FlashSize::Size4MB),
            FirmwarePaths {
                code: "/usr/share/OVMF/OVMF32_CODE_4M.secboot.fd".into(),
                vars: "/usr/share/OVMF/OVMF32_VARS_4M.fd".into(),
            }
        );
        assert_eq!(
            FirmwarePaths::new(share, Machine::Aavmf, Some(Variant::Snakeoil), FlashSize::Default),
            FirmwarePaths {
                code: "/usr/share/AAVMF/AAVMF_CODE.snakeoil.fd".into(),
                vars: "/usr/share/AAVMF/AAVMF_VARS.snakeoil.fd".into(),
            }
        );
    }

    fn fake_firmware(machine: Machine, variant: Option<Variant>) -> TempDir {
        let dir = TempDir::new().unwrap();
        let paths = FirmwarePaths::new(dir.path(), machine, variant, FlashSize::Default);
        fs_err::create_dir_all(paths.code.parent().unwrap()).unwrap();
        fs_err::write(&paths.code, b"code").unwrap();
        fs_err::write(&paths.vars, b"vars").unwrap();
        dir
    }

    #[test]
    fn test_missing_firmware() {
        let dir = TempDir::new().unwrap();
        let err = QemuCommand::new(dir.path(), Machine::Aavmf, None, FlashSize::Default)
            .unwrap_err();
        assert!(matches!(err, Error::MissingFirmware(_)));
    }

    #[test]
    fn test_secure_q35_command() {
        let dir = fake_firmware(Machine::OvmfQ35, Some(Variant::Ms));
        let mut qemu =
            QemuCommand::new(dir.path(), Machine::OvmfQ35, Some(Variant::Ms), FlashSize::Default)
                .unwrap();
        qemu.add_disk(Path::new("/tmp/media.iso"));

        let cmd = command_to_string(&qemu.command());
        assert!(cmd.starts_with("qemu-system-x86_64 -machine q35,smm=on,accel=kvm:tcg"));
        assert!(cmd.contains("-global driver=cfi.pflash01,property=secure,value=on"));
        assert!(cmd.contains("-serial stdio"));
        assert!(cmd.contains("OVMF_CODE_4M.ms.fd"));
        assert!(cmd.ends_with(
            "-drive file=/tmp/media.iso,format=raw,if=none,id=disk0 \
             -device virtio-blk-pci,drive=disk0"
        ));
    }

    #[test]
    fn test_vars_are_copied() {
        let dir = fake_firmware(Machine::Aavmf, None);
        let qemu = QemuCommand::new(dir.path(), Machine::Aavmf, None, FlashSize::Default).unwrap();
        let argv: Vec<String> = qemu
            .argv()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let vars_arg = argv
            .iter()
            .find(|a| a.starts_with("if=pflash,format=raw,readonly=off"))
            .unwrap();
        let vars = vars_arg.rsplit_once("file=").unwrap().1;
        assert!(!vars.starts_with(&*dir.path().to_string_lossy()));
        assert_eq!(fs_err::read(vars).unwrap(), b"vars");
    }

    #[test]
    fn test_from_argv() {
        let mut qemu = QemuCommand::from_argv(vec!["qemu-system-aarch64".into(), "-M".into(), "virt".into()]);
        qemu.add_disk(Path::new("a.img"));
        qemu.add_disk(Path::new("b.img"));
        assert_eq!(
            command_to_string(&qemu.command()),
            "qemu-system-aarch64 -M virt \
             -drive file=a.img,format=raw,if=none,id=disk0 -device virtio-blk-pci,drive=disk0 \
             -drive file=b.img,format=raw,if=none,id=disk1 -device virtio-blk-pci,drive=disk1"
        );
    }

    #[test]
    fn test_parse() {
        assert_eq!("ovmf-q35".parse::<Machine>().unwrap(), Machine::OvmfQ35);
        assert_eq!("ms".parse::<Variant>().unwrap(), Variant::Ms);
        assert_eq!("2m".parse::<FlashSize>().unwrap(), FlashSize::Size2MB);
        assert!("ovmf".parse::<Machine>().is_err());
    }
}
