mod admin;
mod campaigns;
mod health_check;
mod webhooks;

pub use admin::*;
pub use campaigns::*;
pub use health_check::*;
pub use webhooks::*;

use rocket::http::{ContentType, Status};
use rocket::Response;
use std::io::Cursor;

/// `{"success": false, "message": ...}` with the given status.
pub(crate) fn json_error(status: Status, message: String) -> Response<'static> {
    let body = serde_json::json!({ "success": false, "message": message }).to_string();
    Response::build()
        .status(status)
        .header(ContentType::JSON)
        .sized_body(body.len(), Cursor::new(body))
        .finalize()
}
