#[derive(Debug, Deserialize)]
struct CreditRequest {
    amount: Money,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TransactionsQuery {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    limit: Option<u32>,
}

#[derive(Debug, Serialize)]
struct TransactionsResponse {
    transactions: Vec<TransactionRecord>,
    total_count: u64,
    page: u32,
    limit: u32,
}

async fn get_account(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
) -> Result<Json<Account>, (StatusCode, Json<ErrorResponse>)> {
    ensure_admin(&state, &headers)?;
    let account = state
        .gateway
        .ledger()
        .get_or_create(&account_id)
        .await
        .map_err(|err| ledger_error_response(&state, err))?;
    Ok(Json(account))
}

async fn credit_account(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
    body: Bytes,
) -> Result<Json<Account>, (StatusCode, Json<ErrorResponse>)> {
    ensure_admin(&state, &headers)?;
    let payload = serde_json::from_slice::<CreditRequest>(&body).map_err(|err| {
        let err = GatewayError::InvalidRequest {
            reason: format!("invalid request body: {err}"),
        };
        tracing::warn!(account_id = %account_id, error = %err, "credit request rejected");
        map_gateway_error(&state, &err)
    })?;
    let description = payload
        .description
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("Credit")
        .to_string();

    let ledger = state.gateway.ledger();
    let balance = ledger
        .credit(&account_id, payload.amount, &description)
        .await
        .map_err(|err| ledger_error_response(&state, err))?;
    tracing::info!(account_id = %account_id, amount = %payload.amount, balance = %balance, "account credited");

    let account = ledger
        .get_or_create(&account_id)
        .await
        .map_err(|err| ledger_error_response(&state, err))?;
    Ok(Json(account))
}

async fn list_transactions(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
    Query(query): Query<TransactionsQuery>,
) -> Result<Json<TransactionsResponse>, (StatusCode, Json<ErrorResponse>)> {
    ensure_admin(&state, &headers)?;
    let (page, limit) = page_bounds(
        query.page.unwrap_or(1),
        query.limit.unwrap_or(DEFAULT_PAGE_SIZE),
    );
    let result = state
        .gateway
        .ledger()
        .list_transactions(&account_id, page, limit)
        .await
        .map_err(|err| ledger_error_response(&state, err))?;
    Ok(Json(TransactionsResponse {
        transactions: result.transactions,
        total_count: result.total_count,
        page,
        limit,
    }))
}
