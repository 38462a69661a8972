use std::path::Path;

use rouille::{Request, Response};

/// Admin listener: liveness on `/health`, readiness on `/ready`.
///
/// The worker is ready once its document root is a directory.
pub fn handle_admin(request: &Request, document_root: &Path) -> Response {
    if request.method() != "GET" && request.method() != "HEAD" {
        return Response::empty_404();
    }
    match request.url().as_str() {
        "/health" => Response::text("OK"),
        "/ready" if document_root.is_dir() => Response::text("READY"),
        "/ready" => Response::text("NOT READY").with_status_code(503),
        _ => Response::empty_404(),
    }
}
