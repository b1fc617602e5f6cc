//! Binding of application requests to device-native profiles.

use std::collections::HashSet;

use crate::types::{NativePixelFormat, NativeProfile, RequestMapping, StreamProfile};
use crate::{Result, SensorError};

/// Find the registered pixel format that turns `native` into `request`.
fn find_pixel_format<'a>(
    request: &StreamProfile,
    native: &NativeProfile,
    pixel_formats: &'a [NativePixelFormat],
) -> Option<&'a NativePixelFormat> {
    pixel_formats
        .iter()
        .find(|pf| pf.fourcc == native.fourcc && pf.provides(request.stream, request.format))
}

fn matches(request: &StreamProfile, native: &NativeProfile) -> bool {
    request.stream == native.stream
        && request.width == native.width
        && request.height == native.height
        && request.fps == native.fps
}

/// Resolve every request against the native profile list.
///
/// Either every request gets exactly one mapping or the whole call fails;
/// no two mappings of one call share a native profile.
pub fn resolve_requests(
    requests: &[StreamProfile],
    natives: &[NativeProfile],
    pixel_formats: &[NativePixelFormat],
) -> Result<Vec<RequestMapping>> {
    if requests.is_empty() {
        return Err(SensorError::UnsupportedRequest("no streams requested".into()));
    }

    let mut taken: HashSet<NativeProfile> = HashSet::new();
    let mut mappings = Vec::with_capacity(requests.len());

    for request in requests {
        let mut candidate = None;
        let mut collided = false;
        for native in natives.iter().filter(|n| matches(request, n)) {
            let Some(pf) = find_pixel_format(request, native, pixel_formats) else {
                continue;
            };
            if taken.contains(native) {
                collided = true;
                continue;
            }
            candidate = Some((native, pf));
            break;
        }

        match candidate {
            Some((native, pf)) => {
                log::debug!(
                    "Mapped {} -> {}x{}@{} {}",
                    request,
                    native.width,
                    native.height,
                    native.fps,
                    native.fourcc
                );
                taken.insert(*native);
                mappings.push(RequestMapping {
                    request: *request,
                    native: *native,
                    pixel_format: pf.clone(),
                });
            }
            None if collided => {
                return Err(SensorError::UnsupportedRequest(format!(
                    "{} targets a native profile already claimed by another request",
                    request
                )));
            }
            None => {
                return Err(SensorError::UnsupportedRequest(format!(
                    "{} has no matching native profile",
                    request
                )));
            }
        }
    }

    Ok(mappings)
}

/// Every profile an application may request, given the native list.
pub fn principal_requests(
    natives: &[NativeProfile],
    pixel_formats: &[NativePixelFormat],
) -> Vec<StreamProfile> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for native in natives {
        for pf in pixel_formats.iter().filter(|pf| pf.fourcc == native.fourcc) {
            for &(stream, format) in pf.outputs.iter().filter(|(s, _)| *s == native.stream) {
                let profile =
                    StreamProfile::new(stream, format, native.width, native.height, native.fps);
                if seen.insert(profile) {
                    out.push(profile);
                }
            }
        }
    }
    out
}
