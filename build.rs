fn main() -> anyhow::Result<()> {
    // Necessary for ESP-IDF
    #[cfg(feature = "espidf")]
    {
        embuild::espidf::sysenv::output();

        // Add crash log helper for better panic diagnostics
        println!("cargo:rustc-link-arg=-Wl,--undefined=esp_backtrace_print_app_description");
    }

    // Allow the baked-in update token to be provided at build time
    println!("cargo:rerun-if-env-changed=OTA_UPDATE_TOKEN");
    match std::env::var("OTA_UPDATE_TOKEN") {
        Ok(token) => println!("cargo:rustc-env=OTA_UPDATE_TOKEN={}", token),
        Err(_) => println!("cargo:rustc-env=OTA_UPDATE_TOKEN="),
    }

    Ok(())
}
