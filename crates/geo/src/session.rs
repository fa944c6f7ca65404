use crate::{gdalinterop, Result};

/// Scoped process configuration.
///
/// Applies GDAL/PROJ configuration options and remembers the values they
/// replaced; dropping the session restores the previous state so nested
/// tools never observe each other's settings.
pub struct Session {
    restore: Vec<(String, Option<String>)>,
}

impl Session {
    pub fn new() -> Self {
        Session { restore: Vec::new() }
    }

    pub fn with_debug_logging(debug: bool) -> Self {
        gdalinterop::route_cpl_to_log(debug);
        Session::new()
    }

    /// Set a GDAL config option for the lifetime of this session.
    pub fn set_config_option(&mut self, key: &str, value: &str) -> Result {
        let previous = gdal::config::get_config_option(key, "").ok().filter(|v| !v.is_empty());
        gdal::config::set_config_option(key, value)?;
        self.restore.push((key.to_string(), previous));
        Ok(())
    }

    /// Point PROJ at a specific resource directory.
    pub fn set_proj_data(&mut self, path: &std::path::Path) -> Result {
        self.set_config_option("PROJ_DATA", path.to_string_lossy().as_ref())
    }
}

impl Default for Session {
    fn default() -> Self {
        Session::new()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // restore in reverse so re-set keys unwind correctly
        for (key, previous) in self.restore.drain(..).rev() {
            let result = match previous {
                Some(value) => gdal::config::set_config_option(&key, &value),
                None => gdal::config::clear_config_option(&key),
            };
            if let Err(err) = result {
                log::warn!("Failed to restore GDAL config option {key}: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restores_previous_value_on_drop() {
        gdal::config::set_config_option("CUDEM_TEST_OPT", "before").unwrap();
        {
            let mut session = Session::new();
            session.set_config_option("CUDEM_TEST_OPT", "during").unwrap();
            assert_eq!(gdal::config::get_config_option("CUDEM_TEST_OPT", "").unwrap(), "during");
        }
        assert_eq!(gdal::config::get_config_option("CUDEM_TEST_OPT", "").unwrap(), "before");
    }
}
