//! Database module for catalog persistence using SeaORM

pub mod entities;
pub mod retry;

use sea_orm::{ConnectionTrait, Database, DatabaseConnection, DbErr, Statement};

/// Connect to the catalog database and create tables.
///
/// `db_url` is any SeaORM connection string, e.g. `sqlite:catalog.db?mode=rwc`
/// or `sqlite::memory:` for tests.
pub async fn init_database(db_url: &str) -> Result<DatabaseConnection, DbErr> {
    tracing::info!("Connecting to database: {}", db_url);

    let db = Database::connect(db_url).await?;

    create_tables(&db).await?;

    Ok(db)
}

/// Create all tables if they don't exist
pub async fn create_tables(db: &DatabaseConnection) -> Result<(), DbErr> {
    // Datasets table (packing configuration)
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"
        CREATE TABLE IF NOT EXISTS datasets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            piece_size INTEGER NOT NULL,
            chunk_size INTEGER NOT NULL DEFAULT 1048576,
            output_dirs TEXT NOT NULL DEFAULT '[]',
            delete_after_export INTEGER NOT NULL DEFAULT 0
        )
        "#
        .to_string(),
    ))
    .await?;

    // Sources table (one backend root per dataset entry)
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            dataset_id INTEGER NOT NULL,
            kind TEXT NOT NULL,
            path TEXT NOT NULL,
            FOREIGN KEY (dataset_id) REFERENCES datasets(id) ON DELETE CASCADE
        )
        "#
        .to_string(),
    ))
    .await?;

    // Pack jobs table
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"
        CREATE TABLE IF NOT EXISTS pack_jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id INTEGER NOT NULL,
            state TEXT NOT NULL DEFAULT 'created',
            error_message TEXT,
            FOREIGN KEY (source_id) REFERENCES sources(id) ON DELETE CASCADE
        )
        "#
        .to_string(),
    ))
    .await?;

    // Directories table (source tree, parent_id NULL marks the root)
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"
        CREATE TABLE IF NOT EXISTS directories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id INTEGER NOT NULL,
            parent_id INTEGER,
            name TEXT NOT NULL,
            cid TEXT,
            data BLOB NOT NULL DEFAULT x'',
            exported INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (source_id) REFERENCES sources(id) ON DELETE CASCADE,
            FOREIGN KEY (parent_id) REFERENCES directories(id) ON DELETE CASCADE
        )
        "#
        .to_string(),
    ))
    .await?;

    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"CREATE INDEX IF NOT EXISTS idx_directories_parent ON directories(parent_id)"#
            .to_string(),
    ))
    .await?;
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"CREATE INDEX IF NOT EXISTS idx_directories_source ON directories(source_id)"#
            .to_string(),
    ))
    .await?;

    // Files table
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"
        CREATE TABLE IF NOT EXISTS files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id INTEGER NOT NULL,
            directory_id INTEGER NOT NULL,
            path TEXT NOT NULL,
            size INTEGER NOT NULL,
            cid TEXT,
            FOREIGN KEY (source_id) REFERENCES sources(id) ON DELETE CASCADE,
            FOREIGN KEY (directory_id) REFERENCES directories(id) ON DELETE CASCADE
        )
        "#
        .to_string(),
    ))
    .await?;

    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"CREATE INDEX IF NOT EXISTS idx_files_directory ON files(directory_id)"#.to_string(),
    ))
    .await?;

    // File ranges table (byte intervals, packed independently)
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"
        CREATE TABLE IF NOT EXISTS file_ranges (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_id INTEGER NOT NULL,
            pack_job_id INTEGER,
            "offset" INTEGER NOT NULL,
            length INTEGER NOT NULL,
            cid TEXT,
            FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE,
            FOREIGN KEY (pack_job_id) REFERENCES pack_jobs(id) ON DELETE SET NULL
        )
        "#
        .to_string(),
    ))
    .await?;

    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"CREATE INDEX IF NOT EXISTS idx_file_ranges_file ON file_ranges(file_id)"#.to_string(),
    ))
    .await?;
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"CREATE INDEX IF NOT EXISTS idx_file_ranges_pack_job ON file_ranges(pack_job_id)"#
            .to_string(),
    ))
    .await?;

    // Cars table (one row per produced CAR file)
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"
        CREATE TABLE IF NOT EXISTS cars (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            piece_cid TEXT NOT NULL,
            piece_size INTEGER NOT NULL,
            root_cid TEXT NOT NULL,
            file_size INTEGER NOT NULL,
            file_path TEXT NOT NULL,
            pack_job_id INTEGER,
            dataset_id INTEGER NOT NULL,
            source_id INTEGER,
            header BLOB NOT NULL,
            FOREIGN KEY (pack_job_id) REFERENCES pack_jobs(id) ON DELETE SET NULL,
            FOREIGN KEY (dataset_id) REFERENCES datasets(id) ON DELETE CASCADE
        )
        "#
        .to_string(),
    ))
    .await?;

    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"CREATE INDEX IF NOT EXISTS idx_cars_pack_job ON cars(pack_job_id)"#.to_string(),
    ))
    .await?;

    // Car blocks table (block frame index per CAR)
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"
        CREATE TABLE IF NOT EXISTS car_blocks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            car_id INTEGER NOT NULL,
            cid TEXT NOT NULL,
            car_offset INTEGER NOT NULL,
            varint_size INTEGER NOT NULL,
            raw_block_size INTEGER NOT NULL,
            FOREIGN KEY (car_id) REFERENCES cars(id) ON DELETE CASCADE
        )
        "#
        .to_string(),
    ))
    .await?;

    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"CREATE INDEX IF NOT EXISTS idx_car_blocks_car ON car_blocks(car_id)"#.to_string(),
    ))
    .await?;

    tracing::info!("Database tables initialized");
    Ok(())
}
