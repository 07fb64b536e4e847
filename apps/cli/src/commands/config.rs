//! 工位布局命令
//!
//! 生成、校验和查看工位布局文件（TOML / JSON）

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use inspect_tools::StationFile;
use std::path::{Path, PathBuf};

/// 默认布局文件名
pub const DEFAULT_STATION_FILE: &str = "stations.toml";

/// 配置命令
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// 写出默认 7 工位布局
    Init {
        /// 输出文件路径（.toml 或 .json）
        #[arg(short, long, default_value = DEFAULT_STATION_FILE)]
        output: PathBuf,

        /// 覆盖已存在的文件
        #[arg(short, long)]
        force: bool,
    },

    /// 校验布局文件
    Check {
        /// 布局文件路径
        path: PathBuf,
    },

    /// 打印布局（不指定文件时打印默认布局）
    Show {
        /// 布局文件路径
        path: Option<PathBuf>,
    },
}

impl ConfigCommand {
    pub fn execute(self) -> Result<()> {
        match self {
            ConfigCommand::Init { output, force } => Self::init_(&output, force),
            ConfigCommand::Check { path } => Self::check_(&path),
            ConfigCommand::Show { path } => Self::show_(path.as_deref()),
        }
    }

    fn init_(output: &Path, force: bool) -> Result<()> {
        if output.exists() && !force {
            bail!(
                "{} already exists (use --force to overwrite)",
                output.display()
            );
        }

        StationFile::default()
            .save(output)
            .with_context(|| format!("Failed to write {}", output.display()))?;

        println!("✅ Wrote default station layout to {}", output.display());
        Ok(())
    }

    fn check_(path: &Path) -> Result<()> {
        let file = StationFile::load(path)
            .with_context(|| format!("Station file {} is invalid", path.display()))?;

        println!(
            "✅ {}: {} stations, {} enabled",
            path.display(),
            file.stations.len(),
            file.enabled_stations().count()
        );
        Ok(())
    }

    fn show_(path: Option<&Path>) -> Result<()> {
        let file = match path {
            Some(path) => StationFile::load(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => StationFile::default(),
        };

        print!("{}", render_layout(&file));
        Ok(())
    }
}

/// 渲染工位布局表格
pub fn render_layout(file: &StationFile) -> String {
    let mut out = format!(
        "{:<14} {:<14} {:>6} {:>7} {:>8} {:>9} {:>8} {:>7}\n",
        "STATION", "NAME", "SENSOR", "TRIGGER", "EJECTOR", "PULSE(ms)", "HW-TRIG", "ENABLED"
    );
    for s in &file.stations {
        out.push_str(&format!(
            "{:<14} {:<14} {:>6} {:>7} {:>8} {:>9.1} {:>8} {:>7}\n",
            s.station_id.as_str(),
            s.display_name,
            s.sensor_line,
            s.trigger_line,
            s.ejector_distance,
            s.trigger_pulse_ms,
            if s.use_hardware_trigger { "yes" } else { "no" },
            if s.enabled { "yes" } else { "no" },
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_then_check() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("line.toml");

        ConfigCommand::Init {
            output: path.clone(),
            force: false,
        }
        .execute()
        .unwrap();
        ConfigCommand::Check { path: path.clone() }.execute().unwrap();

        // 已存在且未指定 --force
        assert!(
            ConfigCommand::Init {
                output: path.clone(),
                force: false,
            }
            .execute()
            .is_err()
        );
        ConfigCommand::Init {
            output: path,
            force: true,
        }
        .execute()
        .unwrap();
    }

    #[test]
    fn test_check_rejects_conflict() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("line.json");
        std::fs::write(
            &path,
            r#"{"stations": [
                {"station_id": "A", "display_name": "A", "sensor_line": 0, "trigger_line": 0},
                {"station_id": "B", "display_name": "B", "sensor_line": 0, "trigger_line": 1}
            ]}"#,
        )
        .unwrap();

        assert!(ConfigCommand::Check { path }.execute().is_err());
    }

    #[test]
    fn test_render_layout() {
        let table = render_layout(&StationFile::default());
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 8);
        assert!(lines[1].starts_with("TOP"));
        assert!(lines[7].starts_with("TOP_SEAL"));
    }
}
