use rocket::response::status;
use rocket::response::status::BadRequest;
use rocket::Request;

/// Bodies that fail to deserialize are a client error, not a 422.
#[catch(422)]
pub fn unprocessable_entity_to_bad_request(_req: &Request) -> BadRequest<()> {
    status::BadRequest(())
}
