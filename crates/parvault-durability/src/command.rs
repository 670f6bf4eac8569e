//! par2 command lines and the on-disk parity layout.
//!
//! Parity volumes live in a dedicated directory (`.parity` by default) next
//! to the protected data:
//!
//! | mode | index file | base (`-B`) |
//! |---|---|---|
//! | file | `<parent>/.parity/<name>.par2` | `<parent>` |
//! | directory | `<dir>/.parity/<stem>.par2` | `<dir>` |
//! | directory, batched | `<stem>-<subdir>.par2` or `<stem>.part<NNN>.par2` | `<dir>` |
//! | individual | `<dir>/.parity/<relative path, '/' as '__'>@<category>.par2` | `<dir>` |
//!
//! A directory stem is the directory name, suffixed with the normalized
//! file-type filter (`media.jpg+mkv`) when the scope has one, so scopes that
//! share a directory never share parity.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use parvault_core::{ProtectionMode, VaultError, VaultResult};
use serde::{Deserialize, Serialize};

use crate::config::{BatchStrategy, ParityConfig};

const PARITY_EXTENSION: &str = "par2";
/// Arguments other than data files: subcommand, flags and the parity file.
const FIXED_ARG_BUDGET: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Par2Subcommand {
    Create,
    Verify,
    Repair,
}

impl Par2Subcommand {
    #[must_use]
    pub const fn flag(self) -> &'static str {
        match self {
            Self::Create => "c",
            Self::Verify => "v",
            Self::Repair => "r",
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Verify => "verify",
            Self::Repair => "repair",
        }
    }
}

impl fmt::Display for Par2Subcommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One independently named parity set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParitySet {
    pub label: String,
    pub base_path: PathBuf,
    pub parity_file: PathBuf,
    /// Data files covered (create only; verify/repair read them from the index).
    pub files: Vec<PathBuf>,
}

impl ParitySet {
    /// A set reconstructed from an existing index file.
    #[must_use]
    pub fn existing(base_path: impl Into<PathBuf>, parity_file: impl Into<PathBuf>) -> Self {
        let parity_file = parity_file.into();
        Self {
            label: index_stem(&parity_file).unwrap_or_default(),
            base_path: base_path.into(),
            parity_file,
            files: Vec::new(),
        }
    }
}

/// A fully built par2 invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Par2Command {
    pub subcommand: Par2Subcommand,
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl Par2Command {
    #[must_use]
    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }

    /// Space-joined rendering for logs and results.
    #[must_use]
    pub fn display_line(&self) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(OsStr::to_string_lossy)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Builds par2 command lines from [`ParityConfig`] and the host core count.
#[derive(Debug, Clone)]
pub struct CommandBuilder<'a> {
    config: &'a ParityConfig,
    cores: usize,
}

impl<'a> CommandBuilder<'a> {
    #[must_use]
    pub const fn new(config: &'a ParityConfig, cores: usize) -> Self {
        Self { config, cores }
    }

    /// `⌊cores × cpu_limit / 100⌋`, at least 1.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        (self.cores * usize::from(self.config.cpu_limit_percent) / 100).max(1)
    }

    #[must_use]
    pub fn create(&self, set: &ParitySet, redundancy: u8) -> Par2Command {
        let mut args = self.leading_args(Par2Subcommand::Create, &set.base_path);
        match self.config.target_size_mb {
            Some(target) => args.push(format!("-rm{target}").into()),
            None => args.push(format!("-r{redundancy}").into()),
        }
        self.push_resource_args(&mut args);
        if let Some(blocks) = self.config.block_count {
            args.push(format!("-b{blocks}").into());
        } else if let Some(size) = self.config.block_size {
            args.push(format!("-s{size}").into());
        }
        if let Some(count) = self.config.recovery_file_count {
            args.push(format!("-n{count}").into());
        }
        if !self.config.debug {
            args.push("-q".into());
        }
        args.push(set.parity_file.clone().into_os_string());
        args.extend(set.files.iter().map(|file| file.clone().into_os_string()));
        self.finish(Par2Subcommand::Create, args)
    }

    #[must_use]
    pub fn verify(&self, set: &ParitySet) -> Par2Command {
        self.check(Par2Subcommand::Verify, set)
    }

    #[must_use]
    pub fn repair(&self, set: &ParitySet) -> Par2Command {
        self.check(Par2Subcommand::Repair, set)
    }

    // Verify and repair output is parsed, so it is never quieted.
    fn check(&self, subcommand: Par2Subcommand, set: &ParitySet) -> Par2Command {
        let mut args = self.leading_args(subcommand, &set.base_path);
        self.push_resource_args(&mut args);
        args.push(set.parity_file.clone().into_os_string());
        self.finish(subcommand, args)
    }

    fn leading_args(&self, subcommand: Par2Subcommand, base_path: &Path) -> Vec<OsString> {
        let mut base = OsString::from("-B");
        base.push(base_path.as_os_str());
        vec![subcommand.flag().into(), base]
    }

    fn push_resource_args(&self, args: &mut Vec<OsString>) {
        args.push(format!("-t{}", self.thread_count()).into());
        if let Some(memory) = self.config.memory_limit_mb {
            args.push(format!("-m{memory}").into());
        }
    }

    fn finish(&self, subcommand: Par2Subcommand, args: Vec<OsString>) -> Par2Command {
        Par2Command {
            subcommand,
            program: self.config.binary.clone(),
            args,
        }
    }
}

/// Maps protected paths to parity sets.
#[derive(Debug, Clone)]
pub struct ParityLayout<'a> {
    config: &'a ParityConfig,
}

impl<'a> ParityLayout<'a> {
    #[must_use]
    pub const fn new(config: &'a ParityConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn parity_dir_name(&self) -> &str {
        &self.config.parity_dir_name
    }

    /// Directory passed as `-B` for an item.
    #[must_use]
    pub fn base_dir(mode: &ProtectionMode, path: &Path) -> PathBuf {
        match mode {
            ProtectionMode::File => parent_or_dot(path),
            ProtectionMode::Directory | ProtectionMode::IndividualFiles { .. } => {
                path.to_path_buf()
            }
        }
    }

    #[must_use]
    pub fn parity_dir(&self, mode: &ProtectionMode, path: &Path) -> PathBuf {
        Self::base_dir(mode, path).join(&self.config.parity_dir_name)
    }

    pub fn plan_file(&self, file: &Path) -> VaultResult<ParitySet> {
        let name = file_name(file)?;
        let base_path = parent_or_dot(file);
        Ok(ParitySet {
            label: name.clone(),
            parity_file: base_path
                .join(&self.config.parity_dir_name)
                .join(format!("{name}.{PARITY_EXTENSION}")),
            base_path,
            files: vec![file.to_path_buf()],
        })
    }

    /// Index stem for a directory scope. `file_types` is expected normalized.
    pub fn directory_stem(dir: &Path, file_types: Option<&[String]>) -> VaultResult<String> {
        let dir_name = file_name(dir)?;
        Ok(match file_types {
            Some(types) if !types.is_empty() => format!("{dir_name}.{}", types.join("+")),
            _ => dir_name,
        })
    }

    /// One set when the file list fits in `max_args`, otherwise batches per
    /// the configured strategy.
    pub fn plan_directory(
        &self,
        dir: &Path,
        file_types: Option<&[String]>,
        files: Vec<PathBuf>,
    ) -> VaultResult<Vec<ParitySet>> {
        let dir_name = Self::directory_stem(dir, file_types)?;
        let per_set = self.config.max_args.saturating_sub(FIXED_ARG_BUDGET).max(1);
        if files.len() <= per_set {
            return Ok(vec![self.directory_set(dir, dir_name, files)]);
        }

        let sets = match self.config.batch_strategy {
            BatchStrategy::BySubdirectory => {
                let mut groups: BTreeMap<Option<String>, Vec<PathBuf>> = BTreeMap::new();
                for file in files {
                    groups
                        .entry(first_component(dir, &file))
                        .or_default()
                        .push(file);
                }
                let mut sets = Vec::new();
                for (group, members) in groups {
                    let stem = match group {
                        Some(subdir) => format!("{dir_name}-{subdir}"),
                        None => dir_name.clone(),
                    };
                    sets.extend(self.chunked_sets(dir, &stem, members, per_set));
                }
                sets
            }
            BatchStrategy::FixedSize => {
                let size = self.config.batch_size.min(per_set);
                self.chunked_sets(dir, &dir_name, files, size)
            }
        };

        tracing::info!(
            target: "parvault.runner",
            dir = %dir.display(),
            sets = sets.len(),
            strategy = ?self.config.batch_strategy,
            "directory split into parity batches"
        );
        Ok(sets)
    }

    /// One set per file, named after its path relative to `dir` and the
    /// category that owns it.
    pub fn plan_individual(
        &self,
        dir: &Path,
        category: &str,
        files: &[PathBuf],
    ) -> VaultResult<Vec<ParitySet>> {
        let parity_dir = dir.join(&self.config.parity_dir_name);
        files
            .iter()
            .map(|file| {
                let relative = file.strip_prefix(dir).map_err(|_| {
                    VaultError::invalid_parameter(
                        "path",
                        file.display().to_string(),
                        format!("is not inside {}", dir.display()),
                    )
                })?;
                let flattened = relative
                    .components()
                    .map(|part| part.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("__");
                Ok(ParitySet {
                    parity_file: parity_dir
                        .join(format!("{flattened}@{category}.{PARITY_EXTENSION}")),
                    label: relative.display().to_string(),
                    base_path: dir.to_path_buf(),
                    files: vec![file.clone()],
                })
            })
            .collect()
    }

    fn directory_set(&self, dir: &Path, stem: String, files: Vec<PathBuf>) -> ParitySet {
        ParitySet {
            parity_file: dir
                .join(&self.config.parity_dir_name)
                .join(format!("{stem}.{PARITY_EXTENSION}")),
            label: stem,
            base_path: dir.to_path_buf(),
            files,
        }
    }

    fn chunked_sets(
        &self,
        dir: &Path,
        stem: &str,
        files: Vec<PathBuf>,
        chunk: usize,
    ) -> Vec<ParitySet> {
        if files.len() <= chunk {
            return vec![self.directory_set(dir, stem.to_owned(), files)];
        }
        files
            .chunks(chunk.max(1))
            .enumerate()
            .map(|(index, members)| {
                self.directory_set(dir, format!("{stem}.part{:03}", index + 1), members.to_vec())
            })
            .collect()
    }
}

/// Index files (not `.volNN+MM` volumes) in `parity_dir` whose stem is
/// `stem` or starts with `stem` followed by `-` or `.part<digits>`.
pub fn discover_index_files(parity_dir: &Path, stem: &str) -> VaultResult<Vec<PathBuf>> {
    if !parity_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in fs::read_dir(parity_dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(candidate) = index_stem(&path) else {
            continue;
        };
        if candidate == stem
            || candidate
                .strip_prefix(stem)
                .is_some_and(|rest| rest.starts_with('-') || is_part_suffix(rest))
        {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

/// The index file plus every recovery volume belonging to it.
pub fn parity_files_of(index_file: &Path) -> VaultResult<Vec<PathBuf>> {
    let Some(stem) = index_stem(index_file) else {
        return Ok(Vec::new());
    };
    let Some(dir) = index_file.parent() else {
        return Ok(Vec::new());
    };
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let volume_prefix = format!("{stem}.vol");
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(OsStr::to_str) else {
            continue;
        };
        let Some(without_ext) = name.strip_suffix(".par2") else {
            continue;
        };
        if without_ext == stem
            || (name.starts_with(&volume_prefix) && is_volume_name(without_ext))
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Whether `path` has the parity extension.
#[must_use]
pub fn is_parity_file(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .is_some_and(|ext| ext.eq_ignore_ascii_case(PARITY_EXTENSION))
}

/// Stem of an index file (`media` for `media.par2`); `None` for volumes and
/// non-parity files.
fn index_stem(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let without_ext = name.strip_suffix(".par2")?;
    if is_volume_name(without_ext) {
        return None;
    }
    Some(without_ext.to_owned())
}

fn is_part_suffix(rest: &str) -> bool {
    rest.strip_prefix(".part")
        .and_then(|tail| tail.split('.').next())
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

/// `name.vol03+04` style suffix.
fn is_volume_name(without_ext: &str) -> bool {
    let Some(index) = without_ext.rfind(".vol") else {
        return false;
    };
    let suffix = &without_ext[index + 4..];
    let Some((start, count)) = suffix.split_once('+') else {
        return false;
    };
    !start.is_empty()
        && !count.is_empty()
        && start.bytes().all(|b| b.is_ascii_digit())
        && count.bytes().all(|b| b.is_ascii_digit())
}

fn first_component(dir: &Path, file: &Path) -> Option<String> {
    let relative = file.strip_prefix(dir).ok()?;
    let mut components = relative.components();
    let first = components.next()?;
    // Loose files have a single component.
    components.next()?;
    match first {
        Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
        _ => None,
    }
}

fn parent_or_dot(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn file_name(path: &Path) -> VaultResult<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| {
            VaultError::invalid_parameter(
                "path",
                path.display().to_string(),
                "has no final path component",
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_of(command: &Par2Command) -> Vec<String> {
        command
            .args
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn thread_count_follows_cpu_limit_with_floor_of_one() {
        let config = ParityConfig {
            cpu_limit_percent: 50,
            ..ParityConfig::default()
        };
        assert_eq!(CommandBuilder::new(&config, 8).thread_count(), 4);
        assert_eq!(CommandBuilder::new(&config, 1).thread_count(), 1);
        let config = ParityConfig {
            cpu_limit_percent: 80,
            ..ParityConfig::default()
        };
        assert_eq!(CommandBuilder::new(&config, 6).thread_count(), 4);
    }

    #[test]
    fn create_command_has_expected_argument_order() {
        let config = ParityConfig {
            cpu_limit_percent: 50,
            memory_limit_mb: Some(512),
            block_count: Some(2_000),
            block_size: Some(4_096),
            recovery_file_count: Some(4),
            ..ParityConfig::default()
        };
        let set = ParitySet {
            label: "media".into(),
            base_path: PathBuf::from("/mnt/user/media"),
            parity_file: PathBuf::from("/mnt/user/media/.parity/media.par2"),
            files: vec![
                PathBuf::from("/mnt/user/media/a.mkv"),
                PathBuf::from("/mnt/user/media/b.mkv"),
            ],
        };
        let command = CommandBuilder::new(&config, 8).create(&set, 15);
        assert_eq!(command.subcommand, Par2Subcommand::Create);
        assert_eq!(
            args_of(&command),
            vec![
                "c",
                "-B/mnt/user/media",
                "-r15",
                "-t4",
                "-m512",
                "-b2000",
                "-n4",
                "-q",
                "/mnt/user/media/.parity/media.par2",
                "/mnt/user/media/a.mkv",
                "/mnt/user/media/b.mkv",
            ],
            "block count wins over block size"
        );
    }

    #[test]
    fn target_size_replaces_percentage_and_debug_drops_quiet() {
        let config = ParityConfig {
            target_size_mb: Some(100),
            block_size: Some(8_192),
            debug: true,
            ..ParityConfig::default()
        };
        let set = ParitySet::existing("/data", "/data/.parity/data.par2");
        let args = args_of(&CommandBuilder::new(&config, 2).create(&set, 10));
        assert!(args.contains(&"-rm100".to_owned()));
        assert!(!args.iter().any(|arg| arg == "-r10"));
        assert!(args.contains(&"-s8192".to_owned()));
        assert!(!args.contains(&"-q".to_owned()));
    }

    #[test]
    fn verify_and_repair_are_never_quiet() {
        let config = ParityConfig::default();
        let set = ParitySet::existing("/data", "/data/.parity/data.par2");
        let builder = CommandBuilder::new(&config, 4);
        assert_eq!(
            args_of(&builder.verify(&set)),
            vec!["v", "-B/data", "-t3", "/data/.parity/data.par2"]
        );
        assert_eq!(args_of(&builder.repair(&set))[0], "r");
        assert_eq!(
            builder.verify(&set).display_line(),
            "par2 v -B/data -t3 /data/.parity/data.par2"
        );
    }

    #[test]
    fn file_and_individual_layouts() {
        let config = ParityConfig::default();
        let layout = ParityLayout::new(&config);

        let set = layout
            .plan_file(Path::new("/mnt/user/docs/report.pdf"))
            .expect("plan file");
        assert_eq!(set.base_path, PathBuf::from("/mnt/user/docs"));
        assert_eq!(
            set.parity_file,
            PathBuf::from("/mnt/user/docs/.parity/report.pdf.par2")
        );

        let sets = layout
            .plan_individual(
                Path::new("/mnt/user/tv"),
                "videos",
                &[PathBuf::from("/mnt/user/tv/show/s01e01.mkv")],
            )
            .expect("plan individual");
        assert_eq!(
            sets[0].parity_file,
            PathBuf::from("/mnt/user/tv/.parity/show__s01e01.mkv@videos.par2")
        );
        assert_eq!(sets[0].base_path, PathBuf::from("/mnt/user/tv"));
        assert!(
            layout
                .plan_individual(Path::new("/mnt/user/tv"), "videos", &[PathBuf::from("/elsewhere/x")])
                .is_err()
        );
    }

    #[test]
    fn oversized_directory_is_split_by_subdirectory() {
        let config = ParityConfig {
            max_args: 20,
            batch_size: 4,
            ..ParityConfig::default()
        };
        let layout = ParityLayout::new(&config);
        let dir = Path::new("/mnt/user/photos");
        let mut files: Vec<PathBuf> = (0..3)
            .map(|i| dir.join(format!("loose{i}.jpg")))
            .collect();
        files.extend((0..3).map(|i| dir.join("2023").join(format!("{i}.jpg"))));
        files.extend((0..6).map(|i| dir.join("2024").join(format!("{i}.jpg"))));

        let sets = layout.plan_directory(dir, None, files).expect("plan");
        let names: Vec<String> = sets
            .iter()
            .map(|set| set.parity_file.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "photos.par2",
                "photos-2023.par2",
                "photos-2024.part001.par2",
                "photos-2024.part002.par2",
            ]
        );
        assert_eq!(sets.iter().map(|set| set.files.len()).sum::<usize>(), 12);
        assert!(sets.iter().all(|set| set.base_path == dir));
    }

    #[test]
    fn oversized_directory_fixed_batches() {
        let config = ParityConfig {
            max_args: 20,
            batch_size: 5,
            batch_strategy: BatchStrategy::FixedSize,
            ..ParityConfig::default()
        };
        let layout = ParityLayout::new(&config);
        let dir = Path::new("/data");
        let files: Vec<PathBuf> = (0..11).map(|i| dir.join(format!("{i}.bin"))).collect();
        let sets = layout.plan_directory(dir, None, files).expect("plan");
        assert_eq!(sets.len(), 3);
        assert!(sets[2].parity_file.ends_with(".parity/data.part003.par2"));
        assert_eq!(sets[2].files.len(), 1);
    }

    #[test]
    fn file_type_scopes_get_their_own_stem() {
        let config = ParityConfig::default();
        let layout = ParityLayout::new(&config);
        let dir = Path::new("/mnt/user/media");
        let mkv = vec!["mkv".to_owned()];
        let pictures = vec!["jpg".to_owned(), "png".to_owned()];

        let all = layout
            .plan_directory(dir, None, vec![dir.join("a.mkv")])
            .expect("plan");
        let videos = layout
            .plan_directory(dir, Some(mkv.as_slice()), vec![dir.join("a.mkv")])
            .expect("plan");
        let images = layout
            .plan_directory(dir, Some(pictures.as_slice()), vec![dir.join("b.jpg")])
            .expect("plan");

        assert!(all[0].parity_file.ends_with(".parity/media.par2"));
        assert!(videos[0].parity_file.ends_with(".parity/media.mkv.par2"));
        assert!(images[0].parity_file.ends_with(".parity/media.jpg+png.par2"));
        assert_eq!(
            ParityLayout::directory_stem(dir, Some(&[][..])).expect("stem"),
            "media"
        );
    }

    #[test]
    fn discovery_separates_index_files_from_volumes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let parity = dir.path();
        for name in [
            "media.par2",
            "media.vol00+01.par2",
            "media.vol01+02.par2",
            "media-2024.par2",
            "media.part001.par2",
            "media.mkv.par2",
            "media.partial.par2",
            "mediaextra.par2",
            "other.par2",
            "notes.txt",
        ] {
            fs::write(parity.join(name), b"x").expect("write");
        }

        let index = discover_index_files(parity, "media").expect("discover");
        let names: Vec<String> = index
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["media-2024.par2", "media.par2", "media.part001.par2"]);

        let volumes = parity_files_of(&parity.join("media.par2")).expect("volumes");
        assert_eq!(volumes.len(), 3);
        assert!(is_parity_file(Path::new("x.PAR2")));
        assert!(!is_parity_file(Path::new("x.par2.bak")));
    }
}
