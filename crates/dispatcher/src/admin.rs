//! 管理请求处理

use std::time::Duration;

use tracing::{info, warn};

use taskgrid_core::{
    labels,
    protocol::{AdminCommand, AdminRequest, AdminResponse},
    GridError,
};

use crate::driver::{DriverContext, DriverExit};

/// 执行管理命令
///
/// 停止与重启在 `shutdown_delay_ms` 之后由后台任务触发，响应会先返回给客户端。
pub fn handle_admin(driver: &DriverContext, request: &AdminRequest) -> AdminResponse {
    if request.password != driver.config.admin_password {
        warn!("管理请求口令错误: {:?}", request.command);
        return failure(GridError::Permission("管理口令错误".to_string()).to_string());
    }

    match request.command {
        AdminCommand::Shutdown | AdminCommand::ShutdownRestart => {
            let exit = if request.command == AdminCommand::Shutdown {
                DriverExit::Shutdown
            } else {
                DriverExit::Restart {
                    delay: Duration::from_millis(request.restart_delay_ms),
                }
            };
            let delay = Duration::from_millis(request.shutdown_delay_ms);
            info!("将在 {:?} 后执行 {:?}", delay, exit);
            schedule_exit(driver, exit, delay);
            success(format!("请求已接受，{}ms 后执行", request.shutdown_delay_ms))
        }
        AdminCommand::ChangeSettings => {
            match driver.bundlers.update_from_parameters(&request.parameters) {
                Ok(config) => {
                    driver
                        .statistics
                        .add_value(labels::BUNDLE_SIZE, config.size as f64);
                    success(format!(
                        "负载均衡已更新: {} (大小: {}, 最大: {})",
                        config.algorithm, config.size, config.max_bundle_size
                    ))
                }
                Err(e) => {
                    warn!("修改负载均衡参数失败: {}", e);
                    failure(e.to_string())
                }
            }
        }
        AdminCommand::ResetStatistics => {
            driver.statistics.reset();
            info!("统计数据已重置");
            success("统计数据已重置")
        }
    }
}

fn schedule_exit(driver: &DriverContext, exit: DriverExit, delay: Duration) {
    if delay.is_zero() {
        driver.request_exit(exit);
        return;
    }
    let sender = driver.exit_sender();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        info!("执行延迟的退出请求: {:?}", exit);
        sender.send_replace(Some(exit));
    });
}

fn success(message: impl Into<String>) -> AdminResponse {
    AdminResponse {
        success: true,
        message: message.into(),
    }
}

fn failure(message: impl Into<String>) -> AdminResponse {
    AdminResponse {
        success: false,
        message: message.into(),
    }
}
