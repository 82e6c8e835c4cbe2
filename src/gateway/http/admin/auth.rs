fn ensure_admin(
    state: &GatewayHttpState,
    headers: &HeaderMap,
) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "not_configured",
            "NOT_CONFIGURED",
            "admin auth not configured",
        ));
    };

    let provided = extract_header(headers, "x-admin-token")
        .or_else(|| extract_bearer(headers))
        .unwrap_or_default();
    if provided == expected {
        return Ok(());
    }

    Err(error_response(
        StatusCode::UNAUTHORIZED,
        "authentication_error",
        "INVALID_ADMIN_TOKEN",
        "invalid admin token",
    ))
}

fn store_error_response(
    state: &GatewayHttpState,
    err: StoreError,
) -> (StatusCode, Json<ErrorResponse>) {
    match err {
        StoreError::KeyLimitReached { max } => error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "KEY_LIMIT_REACHED",
            format!("Maximum number of API keys reached ({max} per account)"),
        ),
        StoreError::KeyOwnedElsewhere { key } => error_response(
            StatusCode::CONFLICT,
            "invalid_request_error",
            "KEY_CONFLICT",
            format!("API key {key} already belongs to another account"),
        ),
        StoreError::Backend(message) => {
            map_gateway_error(state, &GatewayError::Internal { message })
        }
    }
}

fn ledger_error_response(
    state: &GatewayHttpState,
    err: LedgerError,
) -> (StatusCode, Json<ErrorResponse>) {
    match err {
        LedgerError::InvalidAmount { amount } => error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "INVALID_AMOUNT",
            format!("amount must be positive, got {amount}"),
        ),
        LedgerError::InsufficientFunds {
            required,
            available,
        } => map_gateway_error(
            state,
            &GatewayError::InsufficientFunds {
                required,
                available,
            },
        ),
        LedgerError::Store(err) => map_gateway_error(
            state,
            &GatewayError::Ledger {
                message: err.to_string(),
            },
        ),
    }
}
