//! The crate's only window onto the raw GDAL C API. Return codes and
//! pointers coming out of `gdal_sys` calls are translated into [`Error`]
//! here, so the rest of the crate never touches CPL error state.

use std::ffi::CStr;

use crate::{Error, Result};

/// Translate a CPL return code into a domain error naming the operation.
pub fn cpl_result(operation: &'static str, rc: gdal_sys::CPLErr::Type) -> Result {
    if rc == gdal_sys::CPLErr::CE_None {
        Ok(())
    } else {
        Err(Error::Runtime(format!("{operation} failed: {}", take_last_cpl_message())))
    }
}

/// Translate the result of a pointer-returning GDAL call, treating null as
/// failure of the named operation.
pub fn cpl_pointer<T>(operation: &'static str, ptr: *mut T) -> Result<*mut T> {
    if ptr.is_null() {
        Err(Error::Runtime(format!(
            "{operation} produced no result: {}",
            take_last_cpl_message()
        )))
    } else {
        Ok(ptr)
    }
}

/// The pending CPL error message; reading it resets the CPL error state.
fn take_last_cpl_message() -> String {
    let raw = unsafe { gdal_sys::CPLGetLastErrorMsg() };
    let message = if raw.is_null() {
        String::new()
    } else {
        unsafe { CStr::from_ptr(raw) }.to_string_lossy().trim().to_string()
    };
    unsafe { gdal_sys::CPLErrorReset() };

    if message.is_empty() {
        "no detail reported".to_string()
    } else {
        message
    }
}

/// Forward CPL diagnostics into the `log` facade. With `verbose` set GDAL's
/// own debug chatter is enabled as well.
pub fn route_cpl_to_log(verbose: bool) {
    use gdal::errors::CplErrType;

    if verbose {
        if let Err(err) = gdal::config::set_config_option("CPL_DEBUG", "ON") {
            log::debug!("could not enable gdal debug output: {err}");
        }
    }

    gdal::config::set_error_handler(|severity, _number, message| match severity {
        CplErrType::None => {}
        CplErrType::Debug => log::debug!("gdal: {message}"),
        CplErrType::Warning => log::warn!("gdal: {message}"),
        CplErrType::Failure | CplErrType::Fatal => log::error!("gdal: {message}"),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_codes_pass_through() {
        assert!(cpl_result("noop", gdal_sys::CPLErr::CE_None).is_ok());
        assert!(cpl_result("noop", gdal_sys::CPLErr::CE_Failure).is_err());
    }

    #[test]
    fn null_pointers_become_errors() {
        let mut value = 0i32;
        assert!(cpl_pointer("probe", &mut value as *mut i32).is_ok());
        let err = cpl_pointer::<i32>("probe", std::ptr::null_mut()).unwrap_err();
        assert!(err.to_string().contains("probe"));
    }
}
