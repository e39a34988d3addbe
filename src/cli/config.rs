use crate::config::generate::generate_starter_config;
use crate::config::{expand_tilde, DEFAULT_CONFIG_PATHS};
use std::fs;
use std::path::{Path, PathBuf};

pub fn init(stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_content = generate_starter_config();

    if stdout {
        print!("{}", config_content);
        return Ok(());
    }

    let config_path = default_write_path();
    if config_path.exists() {
        eprintln!(
            "Error: Config file already exists at {}",
            config_path.display()
        );
        eprintln!("Remove it first or use --stdout to print the config");
        std::process::exit(1);
    }

    write_config(&config_content, &config_path)?;
    println!("Config file written to {}", config_path.display());
    Ok(())
}

/// The user config location if its directory can be created, otherwise the
/// system location.
fn default_write_path() -> PathBuf {
    let user_config = expand_tilde(Path::new(DEFAULT_CONFIG_PATHS[0]));
    let system_config = PathBuf::from(DEFAULT_CONFIG_PATHS[1]);

    if user_config.starts_with("~") {
        return system_config;
    }
    match user_config.parent().map(fs::create_dir_all) {
        Some(Ok(())) => user_config,
        Some(Err(_)) | None => {
            eprintln!("Warning: Could not create directory for {}", user_config.display());
            eprintln!("Falling back to {}", system_config.display());
            system_config
        }
    }
}

pub fn write_config(config_content: &str, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, config_content)?;
    Ok(())
}

pub fn validate(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path.ok_or("No config file found. Use --config to specify a path.")?;

    println!("Validating config file: {}", path.display());

    match crate::config::load_config(&path) {
        Ok(config) => {
            println!("✓ Config is valid");
            println!(
                "  {} data sources, {} report queries, {} scheduled reports",
                config.datasources.len(),
                config.queries.len(),
                config.scheduled_reports.len()
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Config validation failed:\n{}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_written_starter_config_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.yml");

        write_config(&generate_starter_config(), &path).unwrap();

        let config = crate::config::load_config(&path).unwrap();
        assert_eq!(config.queries.len(), 13);
    }
}
