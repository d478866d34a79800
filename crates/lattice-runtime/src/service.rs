//! Built-in typing discovery service.
//!
//! A producer that allows IDL download streams each loaded document body
//! as one fragment on `com.twoporeguys.librpc.Typing.download`; the
//! consumer pulls them into its own typing context.

use std::sync::Arc;

use lattice_core::{Object, RpcError};
use lattice_typing::{TypingContext, TYPING_INTERFACE};

use crate::call::CallResponse;
use crate::connection::Connection;
use crate::context::Context;

/// Register the `download` method on a context, advertising the typing
/// context's loaded documents.
pub fn allow_idl_download(context: &Context, typing: &Arc<TypingContext>) {
    let typing = typing.clone();
    context.register_func(
        format!("{}.download", TYPING_INTERFACE),
        "Streams loaded IDL documents",
        move |call, _args| {
            let typing = typing.clone();
            async move {
                let mut bodies = Vec::new();
                typing.files_apply(|file| {
                    bodies.push(file.body.clone());
                    true
                });

                for body in bodies {
                    call.yield_fragment(body).await?;
                }

                Ok(Object::null())
            }
        },
    );
}

/// Pull the peer's IDL documents through the typing discovery interface
/// and register them locally. Returns the number of documents received.
pub async fn download_idl(
    conn: &Connection,
    typing: &Arc<TypingContext>,
) -> Result<usize, RpcError> {
    let response = conn
        .call_sync("/", TYPING_INTERFACE, "download", Object::array())
        .await?;

    match response {
        CallResponse::Single(_) => Ok(0),
        CallResponse::Stream(mut stream) => {
            let mut count = 0usize;
            while let Some(item) = stream.next().await {
                let body = item?;
                typing.load_document(format!("downloaded/{}", count), body)?;
                count += 1;
            }
            Ok(count)
        }
    }
}
