use chrono::Utc;

use invoicey_core::domain::client::{Client, ClientId, ClientRoster};

use super::{column, parse_uuid, ClientRepository, RepositoryError};
use crate::DbPool;

pub struct SqlClientRepository {
    pool: DbPool,
}

impl SqlClientRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_client(row: &sqlx::sqlite::SqliteRow) -> Result<Client, RepositoryError> {
    let id: String = column(row, "id")?;

    Ok(Client {
        id: ClientId(parse_uuid(&id, "client.id")?),
        name: column(row, "name")?,
        email: column(row, "email")?,
        phone: column(row, "phone")?,
        address: column(row, "address")?,
    })
}

#[async_trait::async_trait]
impl ClientRepository for SqlClientRepository {
    async fn list_roster(&self) -> Result<ClientRoster, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(
            "SELECT id, name, email, phone, address
             FROM client
             ORDER BY name COLLATE NOCASE ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let clients = rows.iter().map(row_to_client).collect::<Result<Vec<_>, _>>()?;
        Ok(ClientRoster::new(clients))
    }

    async fn find_by_id(&self, id: &ClientId) -> Result<Option<Client>, RepositoryError> {
        let row = sqlx::query("SELECT id, name, email, phone, address FROM client WHERE id = ?")
            .bind(id.0.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_client(r)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, client: Client) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO client (id, name, email, phone, address, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 email = excluded.email,
                 phone = excluded.phone,
                 address = excluded.address",
        )
        .bind(client.id.0.to_string())
        .bind(&client.name)
        .bind(&client.email)
        .bind(&client.phone)
        .bind(&client.address)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
