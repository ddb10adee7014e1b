use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250301_000001_create_inventory_transactions_table::Migration),
            Box::new(m20250301_000002_create_clinical_cases_table::Migration),
            Box::new(m20250301_000003_create_clinical_trips_table::Migration),
            Box::new(m20250301_000004_create_directory_tables::Migration),
            Box::new(m20250301_000005_add_ledger_indexes::Migration),
        ]
    }
}

// Migration implementations

mod m20250301_000001_create_inventory_transactions_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250301_000001_create_inventory_transactions_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(InventoryTransactions::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(InventoryTransactions::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InventoryTransactions::TxnDate)
                                .date()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InventoryTransactions::Action)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InventoryTransactions::ProductType)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InventoryTransactions::SpecNo)
                                .string()
                                .not_null(),
                        )
                        .col(ColumnDef::new(InventoryTransactions::SerialNo).string().null())
                        .col(
                            ColumnDef::new(InventoryTransactions::Qty)
                                .integer()
                                .not_null()
                                .default(1),
                        )
                        .col(ColumnDef::new(InventoryTransactions::ExpDate).date().null())
                        .col(ColumnDef::new(InventoryTransactions::BatchNo).string().null())
                        .col(ColumnDef::new(InventoryTransactions::CaseId).uuid().null())
                        .col(ColumnDef::new(InventoryTransactions::TripId).uuid().null())
                        .col(
                            ColumnDef::new(InventoryTransactions::Inspection)
                                .string()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(InventoryTransactions::ReturnCondition)
                                .text()
                                .null(),
                        )
                        .col(ColumnDef::new(InventoryTransactions::Notes).text().null())
                        .col(
                            ColumnDef::new(InventoryTransactions::DeletedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(InventoryTransactions::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(InventoryTransactions::Table).to_owned())
                .await
        }
    }

    #[derive(Iden)]
    pub enum InventoryTransactions {
        Table,
        Id,
        TxnDate,
        Action,
        ProductType,
        SpecNo,
        SerialNo,
        Qty,
        ExpDate,
        BatchNo,
        CaseId,
        TripId,
        Inspection,
        ReturnCondition,
        Notes,
        DeletedAt,
        CreatedAt,
    }
}

mod m20250301_000002_create_clinical_cases_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250301_000002_create_clinical_cases_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(ClinicalCases::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ClinicalCases::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ClinicalCases::CaseNo)
                                .string()
                                .null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(ClinicalCases::SiteId).string().not_null())
                        .col(ColumnDef::new(ClinicalCases::PatientId).string().not_null())
                        .col(ColumnDef::new(ClinicalCases::CaseDate).date().not_null())
                        .col(ColumnDef::new(ClinicalCases::Operator).string().null())
                        .col(ColumnDef::new(ClinicalCases::TripId).uuid().null())
                        .col(ColumnDef::new(ClinicalCases::Status).string().not_null())
                        .col(
                            ColumnDef::new(ClinicalCases::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ClinicalCases::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(ClinicalCases::Table).to_owned())
                .await
        }
    }

    #[derive(Iden)]
    pub enum ClinicalCases {
        Table,
        Id,
        CaseNo,
        SiteId,
        PatientId,
        CaseDate,
        Operator,
        TripId,
        Status,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20250301_000003_create_clinical_trips_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250301_000003_create_clinical_trips_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(ClinicalTrips::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ClinicalTrips::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(ClinicalTrips::TripDate).date().not_null())
                        .col(ColumnDef::new(ClinicalTrips::SiteId).string().not_null())
                        .col(ColumnDef::new(ClinicalTrips::Status).string().not_null())
                        .col(
                            ColumnDef::new(ClinicalTrips::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ClinicalTrips::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(ClinicalTrips::Table).to_owned())
                .await
        }
    }

    #[derive(Iden)]
    pub enum ClinicalTrips {
        Table,
        Id,
        TripDate,
        SiteId,
        Status,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20250301_000004_create_directory_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250301_000004_create_directory_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Sites::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Sites::Id)
                                .string()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Sites::Name).string().not_null())
                        .col(ColumnDef::new(Sites::City).string().null())
                        .col(
                            ColumnDef::new(Sites::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ProductSpecs::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ProductSpecs::SpecNo)
                                .string()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(ProductSpecs::ProductType).string().not_null())
                        .col(ColumnDef::new(ProductSpecs::Description).string().null())
                        .col(ColumnDef::new(ProductSpecs::FitsSpecNo).string().null())
                        .col(
                            ColumnDef::new(ProductSpecs::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(ProductSpecs::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Sites::Table).to_owned())
                .await
        }
    }

    #[derive(Iden)]
    pub enum Sites {
        Table,
        Id,
        Name,
        City,
        CreatedAt,
    }

    #[derive(Iden)]
    pub enum ProductSpecs {
        Table,
        SpecNo,
        ProductType,
        Description,
        FitsSpecNo,
        CreatedAt,
    }
}

mod m20250301_000005_add_ledger_indexes {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250301_000005_add_ledger_indexes"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_inventory_txns_spec_serial")
                        .table(InventoryTransactions::Table)
                        .col(InventoryTransactions::SpecNo)
                        .col(InventoryTransactions::SerialNo)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_inventory_txns_case_id")
                        .table(InventoryTransactions::Table)
                        .col(InventoryTransactions::CaseId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_inventory_txns_trip_id")
                        .table(InventoryTransactions::Table)
                        .col(InventoryTransactions::TripId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_index(
                    Index::drop()
                        .name("idx_inventory_txns_spec_serial")
                        .table(InventoryTransactions::Table)
                        .to_owned(),
                )
                .await?;
            manager
                .drop_index(
                    Index::drop()
                        .name("idx_inventory_txns_case_id")
                        .table(InventoryTransactions::Table)
                        .to_owned(),
                )
                .await?;
            manager
                .drop_index(
                    Index::drop()
                        .name("idx_inventory_txns_trip_id")
                        .table(InventoryTransactions::Table)
                        .to_owned(),
                )
                .await
        }
    }

    #[derive(Iden)]
    pub enum InventoryTransactions {
        Table,
        SpecNo,
        SerialNo,
        CaseId,
        TripId,
    }
}
